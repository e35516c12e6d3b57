use shmstore::{ShmTable, TableConfig};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Shared table demo ===\n");

    let name = format!("shmstore-demo-{}", std::process::id());
    let config = TableConfig::new(8, 32);

    let writer = ShmTable::attach_with(&name, config)?;
    let reader = ShmTable::attach_with(&name, config)?;
    println!(
        "writer created the table: {}, reader created it: {}",
        writer.is_creator(),
        reader.is_creator()
    );

    for (key, text) in [(1, "one"), (9, "nine"), (17, "seventeen"), (4, "four")] {
        writer.insert(key, text)?;
    }
    println!("reader sees key 9 as {:?}", reader.lookup(9)?);

    writer.delete(9)?;
    println!("after delete, reader sees key 9 as {:?}", reader.lookup(9)?);

    println!("\nBuckets as seen by the reader:");
    let mut last = None;
    reader.for_each_bucket(|bucket, key, value| {
        if last != Some(bucket) {
            println!("Bucket: {bucket}");
            last = Some(bucket);
        }
        println!("\tkey: {key} data: {}", String::from_utf8_lossy(value));
    })?;

    println!("\n{:?}", reader.stats()?);

    reader.detach(false)?;
    writer.detach(true)?;
    Ok(())
}
