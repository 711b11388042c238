//! Format a device file, store a few records, read them back.
//!
//! Run with: cargo run --example basic_usage

use tinyfs::{FileDevice, FormatParams, Result, TinyFs};

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let path = std::env::temp_dir().join("tinyfs-basic-usage.img");
    let device = FileDevice::create(&path, 1000, 512)?;

    let mut fs = TinyFs::format(
        device,
        &FormatParams {
            num_pages: 1000,
            erase_first: true,
            ..FormatParams::default()
        },
    )?;

    // Append fixed-size records to a log file, one page at a time.
    let mut log = fs.open("events.log")?;
    for page in 0..4u32 {
        let record = [page as u8; 512];
        fs.write(&mut log, page, &record, 0)?;
    }
    fs.close(log)?;

    // Reopen and read back.
    let mut log = fs.open("events.log")?;
    println!(
        "events.log: {} full pages, {} bytes on the last page",
        log.eof_page(),
        log.eof_byte()
    );

    let mut buf = [0u8; 512];
    fs.read(&mut log, 2, &mut buf, 0)?;
    println!("page 2 starts with {:?}", &buf[..8]);
    fs.close(log)?;

    println!("events.log exists: {}", fs.exists("events.log")?);
    fs.remove("events.log")?;
    println!("after remove: {}", fs.exists("events.log")?);

    fs.unmount()?;
    std::fs::remove_file(&path).ok();
    Ok(())
}
