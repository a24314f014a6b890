//! Multi-stage firmware update.
//!
//! ```text
//!  Unknown -> QueryingMode --app--> TransitioningToBoot --+
//!                 |                                        |
//!                 +--boot--> Erasing <---------------------+
//!                               |
//!                            Writing -> Verifying -> Jumping -> Done
//! ```
//!
//! Any stage can end in `Failed`. A device that cannot be held in boot mode
//! never sees an ERASE, and an image that fails CHECK is never jumped to.
//! Without an image the walk ends in `Done` once boot mode is reached.

use crate::error::{Error, Result};
use crate::flasher::{Flasher, Mode, OperationReport};
use crate::image::FirmwareImage;
use log::{debug, info, warn};
use std::fmt;

/// Why an update stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The device could not be moved into (or held in) boot mode.
    CannotReachBoot(String),
    /// The bootloader rejected the written image.
    IntegrityCheck(String),
    /// A stage failed with a lower-level error.
    Stage {
        /// Stage that was running, with its partial progress.
        stage: String,
        /// Error message.
        message: String,
    },
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CannotReachBoot(reason) => write!(f, "cannot reach boot mode: {reason}"),
            Self::IntegrityCheck(reason) => write!(f, "integrity check failed: {reason}"),
            Self::Stage { stage, message } => write!(f, "{stage} failed: {message}"),
        }
    }
}

/// State of an update run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateState {
    /// Not started.
    Unknown,
    /// Asking the device for its mode.
    QueryingMode,
    /// Moving a running application into the bootloader.
    TransitioningToBoot,
    /// Erasing the metadata and payload sectors.
    Erasing,
    /// Writing payload pages and the metadata page.
    Writing,
    /// Asking the bootloader to verify the image.
    Verifying,
    /// Starting the new application.
    Jumping,
    /// Stopped with an error.
    Failed(FailureReason),
    /// Finished.
    Done,
}

impl fmt::Display for UpdateState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown"),
            Self::QueryingMode => write!(f, "querying mode"),
            Self::TransitioningToBoot => write!(f, "entering boot mode"),
            Self::Erasing => write!(f, "erasing"),
            Self::Writing => write!(f, "writing"),
            Self::Verifying => write!(f, "verifying"),
            Self::Jumping => write!(f, "jumping"),
            Self::Failed(reason) => write!(f, "failed ({reason})"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// What the orchestrator knows about the device during one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateSession {
    /// Last mode the device reported.
    pub mode: Mode,
    /// The bootloader is holding the CPU, so erasing is safe.
    pub backup_confirmed: bool,
    /// Outcome of the last integrity check.
    pub integrity: Option<bool>,
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self {
            mode: Mode::Unknown,
            backup_confirmed: false,
            integrity: None,
        }
    }
}

/// Results of a completed update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateReport {
    /// Erase acknowledgements.
    pub erase: OperationReport,
    /// Write acknowledgements (including frame size switches).
    pub write: OperationReport,
    /// Text the bootloader printed for CHECK.
    pub check_text: String,
    /// Text the device printed for the final JUMP.
    pub jump_text: String,
}

/// Progress callback: stage name, current step, total steps.
type Progress<'a> = Box<dyn FnMut(&str, usize, usize) + 'a>;

/// Drives a [`Flasher`] through a complete update.
pub struct Updater<'a> {
    flasher: &'a mut Flasher,
    state: UpdateState,
    session: UpdateSession,
    history: Vec<UpdateState>,
    progress: Option<Progress<'a>>,
    sectors_erased: usize,
    pages_written: usize,
}

impl<'a> Updater<'a> {
    /// Create an updater borrowing `flasher` for one run.
    pub fn new(flasher: &'a mut Flasher) -> Self {
        Self {
            flasher,
            state: UpdateState::Unknown,
            session: UpdateSession::default(),
            history: Vec::new(),
            progress: None,
            sectors_erased: 0,
            pages_written: 0,
        }
    }

    /// Report erase and write progress to `progress`.
    #[must_use]
    pub fn with_progress(mut self, progress: impl FnMut(&str, usize, usize) + 'a) -> Self {
        self.progress = Some(Box::new(progress));
        self
    }

    /// Current state.
    pub fn state(&self) -> &UpdateState {
        &self.state
    }

    /// Every state entered, in order.
    pub fn history(&self) -> &[UpdateState] {
        &self.history
    }

    /// Session data gathered so far.
    pub fn session(&self) -> &UpdateSession {
        &self.session
    }

    /// Run the whole update.
    pub fn run(&mut self, image: &FirmwareImage) -> Result<UpdateReport> {
        info!(
            "Updating to {} ({} bytes at 0x{:08X})",
            image.version(),
            image.payload().len(),
            image.base_address()
        );
        self.drive(Some(image))
    }

    /// Query the mode and move the device into boot mode, without touching
    /// flash.
    pub fn enter_boot(&mut self) -> Result<Mode> {
        self.drive(None)?;
        Ok(self.session.mode)
    }

    fn drive(&mut self, image: Option<&FirmwareImage>) -> Result<UpdateReport> {
        let mut report = UpdateReport::default();
        self.advance(UpdateState::QueryingMode);

        loop {
            let stage = self.state.clone();
            let step = match (&stage, image) {
                (UpdateState::QueryingMode, _) => self.query_mode(),
                (UpdateState::TransitioningToBoot, _) => self.transition_to_boot(),
                (UpdateState::Erasing, Some(image)) => self.erase(image, &mut report),
                (UpdateState::Writing, Some(image)) => self.write(image, &mut report),
                (UpdateState::Verifying, _) => self.verify(&mut report),
                (UpdateState::Jumping, _) => self.jump(&mut report),
                (UpdateState::Done, _) => return Ok(report),
                (state, _) => Err(Error::Protocol(format!("update cannot continue from {state}"))),
            };

            match step {
                Ok(UpdateState::Erasing) if image.is_none() => self.advance(UpdateState::Done),
                Ok(next) => self.advance(next),
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    fn advance(&mut self, next: UpdateState) {
        info!("Update: {} -> {next}", self.state);
        self.history.push(next.clone());
        self.state = next;
    }

    /// Record the failure and convert `error` into what the caller sees.
    fn fail(&mut self, error: Error) -> Error {
        let (reason, error) = match error {
            Error::ModeTransitionFailed(reason) => (
                FailureReason::CannotReachBoot(reason.clone()),
                Error::ModeTransitionFailed(reason),
            ),
            Error::IntegrityCheckFailed(reason) => (
                FailureReason::IntegrityCheck(reason.clone()),
                Error::IntegrityCheckFailed(reason),
            ),
            other => {
                let stage = self.stage_progress();
                (
                    FailureReason::Stage {
                        stage: stage.clone(),
                        message: other.to_string(),
                    },
                    Error::UpdateAborted {
                        stage,
                        source: Box::new(other),
                    },
                )
            },
        };
        warn!("Update failed: {reason}");
        self.advance(UpdateState::Failed(reason));
        error
    }

    /// Name of the running stage with the work completed so far.
    fn stage_progress(&self) -> String {
        match self.state {
            UpdateState::Erasing => {
                format!("erasing ({} sector(s) erased)", self.sectors_erased)
            },
            UpdateState::Writing => {
                format!("writing ({} page(s) written)", self.pages_written)
            },
            ref state => state.to_string(),
        }
    }

    fn query_mode(&mut self) -> Result<UpdateState> {
        let info = self.flasher.info()?;
        self.session.mode = info.mode;
        match info.mode {
            Mode::Boot => {
                self.session.backup_confirmed = true;
                Ok(UpdateState::Erasing)
            },
            Mode::App => Ok(UpdateState::TransitioningToBoot),
            Mode::Unknown => Err(Error::ModeTransitionFailed(format!(
                "device reported an unknown mode ({:?})",
                info.text
            ))),
        }
    }

    fn transition_to_boot(&mut self) -> Result<UpdateState> {
        let text = self.flasher.jump()?;
        debug!("JUMP reply: {text:?}");

        let attempts = self.flasher.config().brick_attempts;
        let mut held = false;
        for attempt in 1..=attempts {
            if self.flasher.save_brick()? {
                debug!("SAVE_BRICK acknowledged on attempt {attempt}/{attempts}");
                held = true;
                break;
            }
            debug!("SAVE_BRICK attempt {attempt}/{attempts} not acknowledged");
        }
        if !held {
            return Err(Error::ModeTransitionFailed(format!(
                "SAVE_BRICK not acknowledged after {attempts} attempt(s)"
            )));
        }

        let info = match self.flasher.info() {
            Ok(info) => info,
            Err(Error::Timeout(_)) => {
                return Err(Error::ModeTransitionFailed(
                    "no reply to INFO after SAVE_BRICK".into(),
                ));
            },
            Err(e) => return Err(e),
        };
        self.session.mode = info.mode;
        if info.mode != Mode::Boot {
            return Err(Error::ModeTransitionFailed(format!(
                "device reports {} after SAVE_BRICK",
                info.mode
            )));
        }

        self.session.backup_confirmed = true;
        Ok(UpdateState::Erasing)
    }

    fn erase(&mut self, image: &FirmwareImage, report: &mut UpdateReport) -> Result<UpdateState> {
        let erased = &mut self.sectors_erased;
        let progress = &mut self.progress;
        report.erase = self.flasher.erase(
            image.erase_start(),
            image.sector_count(),
            &mut |name, current, total| {
                *erased = current;
                if let Some(progress) = progress.as_mut() {
                    progress(name, current, total);
                }
            },
        )?;
        Ok(UpdateState::Writing)
    }

    fn write(&mut self, image: &FirmwareImage, report: &mut UpdateReport) -> Result<UpdateState> {
        let written = &mut self.pages_written;
        let progress = &mut self.progress;
        report.write = self.flasher.write_image(image, &mut |name, current, total| {
            if name == "app" {
                *written = current;
            }
            if let Some(progress) = progress.as_mut() {
                progress(name, current, total);
            }
        })?;
        Ok(UpdateState::Verifying)
    }

    fn verify(&mut self, report: &mut UpdateReport) -> Result<UpdateState> {
        let outcome = self.flasher.check()?;
        self.session.integrity = Some(outcome.passed);
        if !outcome.passed {
            let reason = if outcome.text.is_empty() {
                "no reply to CHECK".to_string()
            } else {
                outcome.text
            };
            return Err(Error::IntegrityCheckFailed(reason));
        }
        info!("Image verified: {}", outcome.text);
        report.check_text = outcome.text;
        Ok(UpdateState::Jumping)
    }

    fn jump(&mut self, report: &mut UpdateReport) -> Result<UpdateState> {
        report.jump_text = self.flasher.jump()?;
        info!("Device: {}", report.jump_text);
        Ok(UpdateState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::FlasherConfig;
    use crate::image::firmware::tests::sample_binary;
    use crate::image::{DEFAULT_BASE_ADDRESS, Version};
    use crate::protocol::{Command, SECTOR_SIZE};
    use crate::sim::{CheckBehavior, SimBehavior, SimDevice, SimMode, test_config};
    use std::time::Duration;

    fn image(payload_len: usize) -> FirmwareImage {
        FirmwareImage::parse(
            &sample_binary(payload_len),
            DEFAULT_BASE_ADDRESS,
            Version::new(2, 1, 0),
        )
        .unwrap()
    }

    fn flasher(device: &SimDevice) -> Flasher {
        Flasher::new(Box::new(device.port()), test_config()).unwrap()
    }

    #[test]
    fn test_update_from_app_reaches_done() {
        let device = SimDevice::new(SimBehavior::in_app());
        let mut flasher = flasher(&device);
        let img = image(3000);
        let mut steps = 0;

        let mut updater = Updater::new(&mut flasher).with_progress(|_, _, _| steps += 1);
        let report = updater.run(&img).unwrap();

        assert_eq!(updater.state(), &UpdateState::Done);
        assert_eq!(
            updater.history(),
            &[
                UpdateState::QueryingMode,
                UpdateState::TransitioningToBoot,
                UpdateState::Erasing,
                UpdateState::Writing,
                UpdateState::Verifying,
                UpdateState::Jumping,
                UpdateState::Done,
            ]
        );
        assert!(updater.session().backup_confirmed);
        assert_eq!(updater.session().integrity, Some(true));
        assert_eq!(report.erase.acknowledged, 2);
        assert_eq!(report.write.mismatches, 0);
        assert_eq!(report.jump_text, "jump to app");
        drop(updater);

        assert!(steps > 0);
        assert_eq!(device.mode(), SimMode::App);
        assert_eq!(device.flash(DEFAULT_BASE_ADDRESS, img.payload().len()), img.payload());
    }

    #[test]
    fn test_update_from_boot_skips_transition() {
        let device = SimDevice::new(SimBehavior::default());
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        updater.run(&image(100)).unwrap();

        assert!(!updater.history().contains(&UpdateState::TransitioningToBoot));
        assert!(!device.requests().contains(&Command::SaveBrick));
    }

    #[test]
    fn test_erase_covers_image_and_metadata() {
        let device = SimDevice::new(SimBehavior::default());
        let mut flasher = flasher(&device);
        let img = image(SECTOR_SIZE as usize + 1);

        Updater::new(&mut flasher).run(&img).unwrap();

        let erases: Vec<u32> = device
            .request_log()
            .iter()
            .filter(|r| r.command == Command::Erase)
            .map(|r| r.address)
            .collect();
        assert_eq!(erases, vec![0x003F_0000, 0x0040_0000, 0x0041_0000]);
    }

    #[test]
    fn test_save_brick_never_acked() {
        let device = SimDevice::new(SimBehavior {
            ack_save_brick: false,
            ..SimBehavior::in_app()
        });
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        let err = updater.run(&image(100)).unwrap_err();

        assert!(matches!(err, Error::ModeTransitionFailed(_)), "{err}");
        assert!(matches!(
            updater.state(),
            UpdateState::Failed(FailureReason::CannotReachBoot(_))
        ));
        let requests = device.requests();
        assert!(!requests.contains(&Command::Erase));
        assert_eq!(requests.iter().filter(|c| **c == Command::SaveBrick).count(), 3);
    }

    #[test]
    fn test_unknown_mode_fails_without_flash_access() {
        let device = SimDevice::new(SimBehavior {
            start_mode: SimMode::Unknown,
            ..SimBehavior::default()
        });
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        let err = updater.run(&image(100)).unwrap_err();

        assert!(matches!(err, Error::ModeTransitionFailed(_)));
        assert!(err.to_string().starts_with("cannot reach boot mode"));
        assert_eq!(device.requests(), vec![Command::Info]);
    }

    #[test]
    fn test_check_failure_prevents_jump() {
        let device = SimDevice::new(SimBehavior {
            check: CheckBehavior::Fail,
            ..SimBehavior::default()
        });
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        let err = updater.run(&image(100)).unwrap_err();

        assert!(matches!(err, Error::IntegrityCheckFailed(_)));
        assert!(err.to_string().starts_with("integrity check failed"));
        assert!(matches!(
            updater.state(),
            UpdateState::Failed(FailureReason::IntegrityCheck(_))
        ));
        assert_eq!(updater.session().integrity, Some(false));

        let requests = device.requests();
        let check_at = requests.iter().position(|c| *c == Command::Check).unwrap();
        assert!(!requests[check_at..].contains(&Command::Jump));
    }

    #[test]
    fn test_silent_check_is_integrity_failure() {
        let device = SimDevice::new(SimBehavior {
            check: CheckBehavior::Silent,
            ..SimBehavior::default()
        });
        let mut flasher = flasher(&device);

        let err = Updater::new(&mut flasher).run(&image(100)).unwrap_err();
        assert!(matches!(err, Error::IntegrityCheckFailed(ref r) if r == "no reply to CHECK"));
    }

    #[test]
    fn test_erase_timeout_reports_stage_progress() {
        let device = SimDevice::new(SimBehavior {
            silent_on: Some(Command::Erase),
            ..SimBehavior::default()
        });
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        let err = updater.run(&image(100)).unwrap_err();

        match &err {
            Error::UpdateAborted { stage, source } => {
                assert_eq!(stage, "erasing (0 sector(s) erased)");
                assert!(matches!(**source, Error::Timeout(_)));
            },
            other => panic!("unexpected {other}"),
        }
        match updater.state() {
            UpdateState::Failed(FailureReason::Stage { stage, .. }) => {
                assert!(stage.starts_with("erasing"));
            },
            other => panic!("unexpected {other}"),
        }
        assert!(!device.requests().contains(&Command::Write));
    }

    #[test]
    fn test_enter_boot_only() {
        let device = SimDevice::new(SimBehavior::in_app());
        let mut flasher = flasher(&device);

        let mode = Updater::new(&mut flasher).enter_boot().unwrap();

        assert_eq!(mode, Mode::Boot);
        assert_eq!(device.mode(), SimMode::Boot);
        assert_eq!(
            device.requests(),
            vec![Command::Info, Command::Jump, Command::SaveBrick, Command::Info]
        );
    }

    #[test]
    fn test_enter_boot_history_stops_before_erase() {
        let device = SimDevice::new(SimBehavior::in_app());
        let mut flasher = flasher(&device);

        let mut updater = Updater::new(&mut flasher);
        updater.enter_boot().unwrap();
        assert_eq!(
            updater.history(),
            &[
                UpdateState::QueryingMode,
                UpdateState::TransitioningToBoot,
                UpdateState::Done,
            ]
        );

        let device = SimDevice::new(SimBehavior::default());
        let mut booted = self::flasher(&device);
        let mut updater = Updater::new(&mut booted);
        assert_eq!(updater.enter_boot().unwrap(), Mode::Boot);
        assert_eq!(updater.history(), &[UpdateState::QueryingMode, UpdateState::Done]);
        assert_eq!(device.requests(), vec![Command::Info]);
    }

    #[test]
    fn test_enter_boot_with_default_timings_beats_save_brick_window() {
        let device = SimDevice::new(SimBehavior {
            quiet_reboot: true,
            ..SimBehavior::in_app()
        });
        let mut flasher = Flasher::new(Box::new(device.port()), FlasherConfig::default()).unwrap();

        let mode = Updater::new(&mut flasher).enter_boot().unwrap();

        assert_eq!(mode, Mode::Boot);
        assert_eq!(device.mode(), SimMode::Boot);
    }

    #[test]
    fn test_save_brick_after_window_finds_app() {
        let device = SimDevice::new(SimBehavior {
            save_brick_window: Duration::from_millis(20),
            ..SimBehavior::in_app()
        });
        let mut flasher = flasher(&device);

        let err = Updater::new(&mut flasher).enter_boot().unwrap_err();

        assert!(matches!(err, Error::ModeTransitionFailed(_)), "{err}");
        assert_eq!(device.mode(), SimMode::App);
        assert!(!device.in_save_brick_window());
    }
}
