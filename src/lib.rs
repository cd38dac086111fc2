pub mod audio;
pub mod interruptions;
pub mod journal;
pub mod notifications;
pub mod ports;
pub mod recorder;
pub mod session;
pub mod settings;
pub mod shell;
mod utils;

use anyhow::Result;
use chrono::Utc;
use log::{info, warn};
use std::sync::Arc;

use audio::{RodioPlayer, SoundAsset};
use interruptions::ManualInterruptionSource;
use journal::Journal;
use notifications::LocalNotificationScheduler;
use ports::{Clock, SystemClock};
use recorder::CpalRecorder;
use session::{SessionConfig, SessionController, SessionPorts};
use settings::{SettingsStore, UserSettings};
use shell::{PromptRouter, Shell, TerminalPresenter};

pub use utils::logging;

/// Open the journal and close out nights a crash left running. A journal
/// that cannot be opened only costs the history.
async fn open_journal(settings: &UserSettings) -> Option<Journal> {
    let path = settings.journal_path();
    let journal = match Journal::open(path.clone()) {
        Ok(journal) => journal,
        Err(err) => {
            warn!("Journal unavailable at {}: {err:#}", path.display());
            return None;
        }
    };

    match journal.interrupt_unfinished(Utc::now()).await {
        Ok(0) => {}
        Ok(recovered) => warn!("Marked {recovered} unfinished night(s) as interrupted"),
        Err(err) => warn!("Failed to recover unfinished nights: {err:#}"),
    }
    Some(journal)
}

pub async fn run() -> Result<()> {
    logging::init();
    info!("sleepalarm starting up...");

    let store = SettingsStore::new(SettingsStore::default_path())?;
    let settings = store.settings();
    info!("Settings loaded from {}", store.path().display());

    let journal = open_journal(&settings).await;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let notifications = Arc::new(LocalNotificationScheduler::new(Arc::clone(&clock)));
    let interruptions = Arc::new(ManualInterruptionSource::new());
    let prompts = PromptRouter::default();
    let recorder = Arc::new(CpalRecorder::new(settings.recordings_dir()));

    let ports = SessionPorts {
        sleep_player: Arc::new(RodioPlayer::new(
            "sleep",
            SoundAsset::from_name(&settings.sleep_sound),
            true,
            settings.volume,
        )),
        alarm_player: Arc::new(RodioPlayer::new(
            "alarm",
            SoundAsset::from_name(&settings.alarm_sound),
            true,
            settings.volume,
        )),
        recorder: recorder.clone(),
        notifications: notifications.clone(),
        presenter: Arc::new(TerminalPresenter::new(prompts.clone())),
        interruptions: interruptions.clone(),
        clock,
    };

    let controller = SessionController::new(ports, SessionConfig::from(&settings), journal.clone());

    let result = Shell {
        controller,
        notifications,
        interruptions,
        journal,
        prompts,
    }
    .run()
    .await;

    // The shell has stopped the session; wait for the recording to land on disk.
    if let Err(err) = tokio::task::spawn_blocking(move || recorder.shutdown()).await {
        warn!("Recorder shutdown failed: {err}");
    }
    info!("sleepalarm stopped");
    result
}
