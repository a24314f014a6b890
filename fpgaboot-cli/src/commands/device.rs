//! Single bootloader commands.

use anyhow::{Context, Result, bail};
use console::style;
use fpgaboot::{FrameMode, Mode, Updater};
use std::io::{self, Write as _};

use super::Session;
use crate::CliError;

/// Listen command implementation.
pub(crate) fn cmd_listen(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    session.status("📡", style("Press Ctrl-C to stop").dim());

    let mut stdout = io::stdout();
    flasher.listen(&mut |text| {
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    })?;
    flasher.close()?;
    Ok(())
}

/// SAVE_BRICK command implementation.
pub(crate) fn cmd_save_brick(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    let attempts = flasher.config().brick_attempts;

    for _ in 0..attempts {
        if flasher.save_brick()? {
            flasher.close()?;
            session.status("✓", "Device held in boot mode");
            return Ok(());
        }
    }
    bail!("SAVE_BRICK not acknowledged after {attempts} attempt(s)")
}

/// Reset command implementation.
pub(crate) fn cmd_reset(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    flasher.reset()?;
    flasher.close()?;
    session.status("🔄", "Reset sent");
    Ok(())
}

/// Enter-boot command implementation.
pub(crate) fn cmd_enter_boot(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    let mode = Updater::new(&mut flasher)
        .enter_boot()
        .context("Failed to enter boot mode")?;
    flasher.close()?;
    session.status("✓", format!("Device is in {} mode", style(mode).green()));
    Ok(())
}

/// ENTER_APP command implementation.
pub(crate) fn cmd_enter_app(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    let acknowledged = flasher.enter_app()?;
    flasher.close()?;
    if !acknowledged {
        bail!("ENTER_APP was not acknowledged");
    }
    session.status("✓", "ENTER_APP acknowledged");
    Ok(())
}

/// NEXT_SET command implementation.
pub(crate) fn cmd_next(session: &Session, size: u32) -> Result<()> {
    let mode = FrameMode::from_size(size).ok_or_else(|| {
        CliError::Usage(format!("unsupported frame size {size} (expected 272 or 16)"))
    })?;

    let mut flasher = session.open()?;
    let acknowledged = flasher.negotiate_frame_size(mode)?;
    flasher.close()?;
    if !acknowledged {
        bail!("frame size {size} was not acknowledged");
    }
    session.status("✓", format!("Device frame size is {size} bytes"));
    Ok(())
}

/// CHECK command implementation.
pub(crate) fn cmd_check(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    let outcome = flasher.check()?;
    flasher.close()?;

    if !outcome.text.is_empty() {
        println!("{}", outcome.text);
    }
    if !outcome.passed {
        bail!(fpgaboot::Error::IntegrityCheckFailed(if outcome.text.is_empty() {
            "no reply to CHECK".to_string()
        } else {
            outcome.text
        }));
    }
    session.status("✓", style("Image verified").green());
    Ok(())
}

/// JUMP command implementation.
pub(crate) fn cmd_jump(session: &Session) -> Result<()> {
    let mut flasher = session.open()?;
    let text = flasher.jump()?;
    flasher.close()?;
    if !text.is_empty() {
        println!("{text}");
    }
    Ok(())
}

/// Device info command implementation.
pub(crate) fn cmd_info(session: &Session, json: bool) -> Result<()> {
    let mut flasher = session.open()?;
    let info = flasher.info()?;
    flasher.close()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    let mode = match info.mode {
        Mode::Boot => style(info.mode).yellow(),
        Mode::App => style(info.mode).green(),
        Mode::Unknown => style(info.mode).red(),
    };
    eprintln!("  Mode: {mode}");
    if !session.quiet() && !info.text.is_empty() {
        eprintln!("  Reply: {}", style(&info.text).dim());
    }
    Ok(())
}
