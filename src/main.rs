#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};

use stm32_uart_bridge::host::{self, FlashOptions, Flasher, ResponseSlot};
use stm32_uart_bridge::linux;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial device of the gateway
    #[structopt(parse(from_os_str))]
    device: PathBuf,

    /// Binary image to flash
    #[structopt(parse(from_os_str))]
    binary: PathBuf,

    /// Log level for console output, debug and trace disable the progress bar
    #[structopt(default_value = "info", possible_values = &["info", "debug", "trace"])]
    log_level: LevelFilter,

    #[structopt(flatten)]
    options: FlashOptions,
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to gateway");

    let (rx, tx) = linux::open_gateway(&o.device)
        .with_context(|| format!("Error opening gateway {}", o.device.display()))?;

    let image = fs::read(&o.binary)
        .with_context(|| format!("Error reading image {}", o.binary.display()))?;
    let total = image.len() as u64;

    info!(
        "Flashing {} ({}) at 0x{:08x}",
        o.binary.display(),
        bytefmt::format(total),
        o.options.base_address
    );

    // Initial stack pointer and reset vector
    if let Some(vectors) = image.get(..8) {
        debug!("Image vectors: {}", hex::encode(vectors));
    }

    let responses = Arc::new(ResponseSlot::new());
    let finished = Arc::new(AtomicBool::new(false));

    let receiver = {
        let responses = responses.clone();
        let finished = finished.clone();
        thread::spawn(move || host::receive(rx, &responses, &finished))
    };

    let bar = if o.log_level == LevelFilter::Info {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner} [{elapsed_precise}] [{bar:40}] {bytes}/{total_bytes}")
                .progress_chars("#>-"),
        );
        Some(bar)
    } else {
        None
    };

    let mut flasher = Flasher::new(tx, &responses, o.options);
    let result = flasher.flash(&image[..], |sent| {
        if let Some(b) = &bar {
            b.set_position(sent as u64);
        }
    });

    finished.store(true, Ordering::Relaxed);
    match receiver.join() {
        Ok(Err(e)) => warn!("Gateway receiver failed: {}", e),
        Err(_) => warn!("Gateway receiver panicked"),
        Ok(Ok(())) => (),
    }

    match result {
        Ok(sent) => {
            if let Some(b) = &bar {
                b.finish_with_message("done");
            }
            info!("Flashed {} bytes, target reset", sent);
            Ok(())
        }
        Err(e) => {
            if let Some(b) = &bar {
                b.abandon();
            }
            Err(e).context("Flashing failed")
        }
    }
}
