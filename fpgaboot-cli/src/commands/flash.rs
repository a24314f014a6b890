//! Erase, write, read, and update command implementations.

use anyhow::{Context, Result};
use console::style;
use fpgaboot::protocol::SECTOR_SIZE;
use fpgaboot::{FirmwareImage, OperationReport, Updater};
use log::warn;
use std::fs;
use std::path::Path;

use super::{Session, progress_reporter};
use crate::{CliError, ImageArgs};

fn report_mismatches(operation: &str, report: &OperationReport) {
    if report.mismatches > 0 {
        warn!(
            "{operation}: {} of {} acknowledgement(s) failed validation",
            report.mismatches,
            report.total()
        );
    }
}

fn describe_image(session: &Session, path: &Path, image: &FirmwareImage) {
    session.status(
        "📦",
        format!(
            "Loaded {}: {} bytes, {} page(s) @ 0x{:08X}, version {}",
            path.display(),
            image.payload().len(),
            image.page_count(),
            image.base_address(),
            image.version()
        ),
    );
}

/// Erase command implementation.
pub(crate) fn cmd_erase(
    session: &Session,
    addr: Option<u32>,
    size: Option<u32>,
    input: Option<&Path>,
) -> Result<()> {
    let (start, sectors) = if let Some(input) = input {
        let image = session.load_image_from(input, addr, None)?;
        (image.erase_start(), image.sector_count())
    } else {
        let start = addr.ok_or_else(|| {
            CliError::Usage("erase needs --addr, or --input to derive the sectors".to_string())
        })?;
        let sectors = size.map_or(1, |size| size.div_ceil(SECTOR_SIZE).max(1));
        (start, sectors)
    };

    let mut flasher = session.open()?;
    session.status(
        "🗑",
        format!("Erasing {sectors} sector(s) from 0x{start:08X}"),
    );

    let pb = session.progress_bar();
    let report = flasher
        .erase(start, sectors, &mut progress_reporter(&pb))
        .context("Erase failed")?;
    pb.finish_and_clear();
    flasher.close()?;

    report_mismatches("erase", &report);
    session.status("✓", style("Erase complete").green());
    Ok(())
}

/// Write and write-only command implementation.
pub(crate) fn cmd_write(session: &Session, args: &ImageArgs, erase: bool) -> Result<()> {
    let image = session.load_image(args)?;
    describe_image(session, &args.input, &image);

    let mut flasher = session.open()?;
    let pb = session.progress_bar();
    let mut progress = progress_reporter(&pb);

    if erase {
        let report = flasher
            .erase(image.erase_start(), image.sector_count(), &mut progress)
            .context("Erase failed")?;
        report_mismatches("erase", &report);
    }
    let report = flasher
        .write_image(&image, &mut progress)
        .context("Write failed")?;
    pb.finish_and_clear();
    flasher.close()?;

    report_mismatches("write", &report);
    session.status("✓", style("Write complete").green());
    Ok(())
}

/// Read command implementation.
pub(crate) fn cmd_read(session: &Session, addr: u32, size: u32, output: &Path) -> Result<()> {
    let mut flasher = session.open()?;
    let data = flasher.read(addr, size).context("Read failed")?;
    flasher.close()?;

    fs::write(output, &data)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    session.status(
        "✓",
        format!(
            "Read {} byte(s) from 0x{addr:08X} to {}",
            data.len(),
            output.display()
        ),
    );
    Ok(())
}

/// Update command implementation.
pub(crate) fn cmd_update(session: &Session, args: &ImageArgs) -> Result<()> {
    let image = session.load_image(args)?;
    describe_image(session, &args.input, &image);

    let mut flasher = session.open()?;
    let pb = session.progress_bar();

    let result = Updater::new(&mut flasher)
        .with_progress(progress_reporter(&pb))
        .run(&image);
    let report = match result {
        Ok(report) => report,
        Err(e) => {
            pb.abandon();
            return Err(e).context("Update failed");
        },
    };
    pb.finish_and_clear();
    flasher.close()?;

    report_mismatches("erase", &report.erase);
    report_mismatches("write", &report.write);
    if !session.quiet() {
        eprintln!(
            "\n{} Update complete: {}",
            style("🎉").green().bold(),
            report.jump_text
        );
    }
    Ok(())
}
