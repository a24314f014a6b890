//! Firmware image info and port listing command implementations.

use anyhow::{Context, Result};
use console::style;
use fpgaboot::{Descriptor, NativePortEnumerator, PortEnumerator};
use std::path::Path;

use super::Session;

/// Image info command implementation.
pub(crate) fn cmd_image_info(
    session: &Session,
    input: &Path,
    addr: Option<u32>,
    json: bool,
) -> Result<()> {
    let image = session.load_image_from(input, addr, None)?;
    let summary = image.summary();

    if json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    eprintln!("{}", style("Firmware Image").bold().underlined());
    eprintln!("  File:          {} ({} bytes)", input.display(), summary.file_size);
    eprintln!("  Payload:       {} bytes", summary.payload_size);
    eprintln!("  Base address:  0x{:08X}", summary.base_address);
    eprintln!("  Version:       {}", summary.version);
    eprintln!(
        "  Erase:         {} sector(s) from 0x{:08X}",
        summary.sectors, summary.erase_start
    );
    eprintln!("  Pages:         {} (+1 metadata)", summary.pages);

    eprintln!("\n{}", style("Descriptors").bold().underlined());
    print_descriptor("app", &summary.app_descriptor);
    print_descriptor("vectors", &summary.vector_descriptor);
    Ok(())
}

fn print_descriptor(name: &str, descriptor: &Descriptor) {
    eprintln!(
        "  {:<8} crc 0x{:08X}  target 0x{:08X}  length {}",
        style(name).cyan(),
        descriptor.crc32,
        descriptor.target_address,
        descriptor.length
    );
}

/// List ports command implementation.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports().context("Failed to list serial ports")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available Serial Ports").bold().underlined());
    if ports.is_empty() {
        eprintln!("  {}", style("No serial ports found").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        eprintln!(
            "  {} {}{vid_pid}{product}",
            style("•").green(),
            style(&port.name).cyan()
        );
    }
    Ok(())
}
