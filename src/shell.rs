use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::{
    io::{self, BufRead},
    str::FromStr,
    sync::{Arc, Mutex},
    thread,
};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::interruptions::ManualInterruptionSource;
use crate::journal::Journal;
use crate::notifications::LocalNotificationScheduler;
use crate::ports::Presenter;
use crate::session::{AlarmTime, RowKind, SessionController, SessionEvent, SleepDuration};

const HISTORY_LIMIT: usize = 10;

/// Hands the next input line to whoever is waiting for an answer. Lines that
/// nobody asked for are shell commands.
#[derive(Clone, Default)]
pub struct PromptRouter {
    waiting: Arc<Mutex<Option<oneshot::Sender<String>>>>,
}

impl PromptRouter {
    /// A newer question replaces an older unanswered one.
    fn ask(&self) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if let Ok(mut waiting) = self.waiting.lock() {
            *waiting = Some(tx);
        }
        rx
    }

    /// Returns the line back when no question is waiting for it.
    pub fn route(&self, line: String) -> Option<String> {
        let waiting = self.waiting.lock().ok().and_then(|mut waiting| waiting.take());
        match waiting {
            Some(tx) => match tx.send(line) {
                Ok(()) => None,
                Err(line) => Some(line),
            },
            None => Some(line),
        }
    }
}

/// Presents pickers and the alarm prompt on stdout and reads answers that
/// the shell routes through a [`PromptRouter`].
pub struct TerminalPresenter {
    prompts: PromptRouter,
}

impl TerminalPresenter {
    pub fn new(prompts: PromptRouter) -> Self {
        Self { prompts }
    }
}

#[async_trait]
impl Presenter for TerminalPresenter {
    async fn present_options(&self, options: Vec<SleepDuration>) -> Option<SleepDuration> {
        println!("Sleep timer:");
        for (index, option) in options.iter().enumerate() {
            println!("  {}) {option}", index + 1);
        }
        println!("Choose a number (Enter to keep the current timer):");

        let answer = self.prompts.ask().await.ok()?;
        let choice = parse_option_choice(&answer, &options);
        if choice.is_none() && !answer.trim().is_empty() {
            println!("'{}' is not one of the options", answer.trim());
        }
        choice
    }

    async fn present_time_picker(&self, initial: Option<AlarmTime>) -> Option<AlarmTime> {
        match initial {
            Some(current) => println!("Alarm time as HH:MM (Enter to keep {current}):"),
            None => println!("Alarm time as HH:MM:"),
        }

        let answer = self.prompts.ask().await.ok()?;
        if answer.trim().is_empty() {
            return None;
        }
        match answer.parse::<AlarmTime>() {
            Ok(time) => Some(time),
            Err(err) => {
                println!("{err:#}");
                None
            }
        }
    }

    async fn present_alarm_prompt(&self, message: &str) {
        println!();
        println!("*** {message} ***");
        println!("Press Enter to stop the alarm.");
        let _ = self.prompts.ask().await;
    }
}

/// 1-based menu pick.
pub fn parse_option_choice(answer: &str, options: &[SleepDuration]) -> Option<SleepDuration> {
    let index = answer.trim().parse::<usize>().ok()?;
    options.get(index.checked_sub(1)?).copied()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Play,
    Pause,
    Timer,
    Alarm,
    Wake,
    Interrupt,
    Resume { should_resume: bool },
    Ack,
    Rows,
    History,
    Help,
    Quit,
}

impl FromStr for Command {
    type Err = anyhow::Error;

    fn from_str(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let command = match (words.next(), words.next()) {
            (Some("play"), None) => Command::Play,
            (Some("pause"), None) => Command::Pause,
            (Some("timer"), None) => Command::Timer,
            (Some("alarm"), None) => Command::Alarm,
            (Some("wake"), None) => Command::Wake,
            (Some("interrupt"), None) => Command::Interrupt,
            (Some("resume"), None) => Command::Resume {
                should_resume: true,
            },
            (Some("resume"), Some("no")) => Command::Resume {
                should_resume: false,
            },
            (Some("ack"), None) => Command::Ack,
            (Some("rows"), None) => Command::Rows,
            (Some("history"), None) => Command::History,
            (Some("help"), None) => Command::Help,
            (Some("quit" | "exit"), None) => Command::Quit,
            _ => bail!("unknown command '{}' (try 'help')", line.trim()),
        };
        if words.next().is_some() {
            bail!("unexpected arguments in '{}'", line.trim());
        }
        Ok(command)
    }
}

const HELP: &str = "\
commands:
  play         start the night, or resume after pause
  pause        pause the sleep sound or the recording
  timer        choose the sleep timer
  alarm        choose the alarm time
  wake         open the wake-up notification
  interrupt    simulate an audio interruption
  resume [no]  end the interruption (with or without a resume hint)
  ack          stop the alarm
  rows         show settings rows and state
  history      show recent nights
  quit         stop and exit";

/// Everything the shell drives.
pub struct Shell {
    pub controller: SessionController,
    pub notifications: Arc<LocalNotificationScheduler>,
    pub interruptions: Arc<ManualInterruptionSource>,
    pub journal: Option<Journal>,
    pub prompts: PromptRouter,
}

impl Shell {
    /// Read commands from stdin until `quit` or end of input.
    pub async fn run(self) -> Result<()> {
        let (lines_tx, mut lines_rx) = mpsc::unbounded_channel::<String>();
        let prompts = self.prompts.clone();
        // Blocking stdin reads stay off the runtime so exit never waits on them.
        thread::Builder::new()
            .name("sleepalarm-stdin".into())
            .spawn(move || {
                for line in io::stdin().lock().lines() {
                    let Ok(line) = line else { break };
                    if let Some(command) = prompts.route(line) {
                        if lines_tx.send(command).is_err() {
                            break;
                        }
                    }
                }
            })
            .context("Failed to spawn stdin reader")?;

        let printer = tokio::spawn(print_events(
            self.controller.events(),
            self.notifications.deliveries(),
        ));

        self.controller.request_permissions().await;
        if !self.controller.permissions_granted().await {
            println!("Microphone or notification access was denied; play is disabled.");
        }
        self.print_rows();
        println!("Type 'help' for commands.");

        while let Some(line) = lines_rx.recv().await {
            if line.trim().is_empty() {
                continue;
            }
            let command = match line.parse::<Command>() {
                Ok(command) => command,
                Err(err) => {
                    println!("{err:#}");
                    continue;
                }
            };
            if command == Command::Quit {
                break;
            }
            self.dispatch(command).await;
        }

        self.controller.shutdown().await;
        printer.abort();
        log::info!("Shell closed");
        Ok(())
    }

    async fn dispatch(&self, command: Command) {
        match command {
            Command::Play => self.controller.play().await,
            Command::Pause => self.controller.pause().await,
            Command::Timer => self.controller.select_row(RowKind::SleepTimer).await,
            Command::Alarm => self.controller.select_row(RowKind::Alarm).await,
            Command::Wake => {
                let pending = self.notifications.pending_ids();
                match pending.first() {
                    Some(id) => {
                        self.notifications.trigger_action(id);
                    }
                    None => println!("No wake-up notification is pending."),
                }
            }
            Command::Interrupt => self.interruptions.begin(),
            Command::Resume { should_resume } => self.interruptions.end(should_resume),
            Command::Ack => self.controller.acknowledge_alarm().await,
            Command::Rows => self.print_rows(),
            Command::History => self.print_history().await,
            Command::Help => println!("{HELP}"),
            Command::Quit => {}
        }
    }

    fn print_rows(&self) {
        let snapshot = self.controller.snapshot();
        for row in &snapshot.rows {
            let marker = if row.enabled { " " } else { "-" };
            println!("{marker} {:<12} {}", row.title, row.detail);
        }
        println!(
            "  state: {} ({})",
            snapshot.display_state.as_str(),
            if snapshot.is_running { "running" } else { "stopped" }
        );
    }

    async fn print_history(&self) {
        let Some(journal) = &self.journal else {
            println!("No journal is open.");
            return;
        };
        match journal.list_sessions(HISTORY_LIMIT).await {
            Ok(sessions) if sessions.is_empty() => println!("No nights recorded yet."),
            Ok(sessions) => {
                for night in sessions {
                    println!(
                        "{}  alarm {}  timer {:<8}  {:<12} {}",
                        night.started_at.format("%Y-%m-%d %H:%M"),
                        night.alarm_time,
                        night.sleep_duration.display_label(),
                        night.status.as_str(),
                        night
                            .alarm_source
                            .map(|source| format!("woken by {}", source.as_str()))
                            .unwrap_or_default()
                    );
                }
            }
            Err(err) => println!("Failed to read history: {err:#}"),
        }
    }
}

async fn print_events(
    mut events: broadcast::Receiver<SessionEvent>,
    mut deliveries: broadcast::Receiver<crate::notifications::Delivery>,
) {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(SessionEvent::StateChanged { display_state, .. }) => {
                    println!("[{}]", display_state.as_str());
                }
                Ok(SessionEvent::Diagnostic { source, message }) => {
                    println!("warning ({source:?}): {message}");
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
            delivered = deliveries.recv() => match delivered {
                Ok(delivery) => println!("Notification: {} (type 'wake' to open it)", delivery.title),
                Err(broadcast::error::RecvError::Lagged(_)) => {}
                Err(broadcast::error::RecvError::Closed) => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_commands() {
        assert_eq!("play".parse::<Command>().unwrap(), Command::Play);
        assert_eq!("  ack ".parse::<Command>().unwrap(), Command::Ack);
        assert_eq!(
            "resume".parse::<Command>().unwrap(),
            Command::Resume {
                should_resume: true
            }
        );
        assert_eq!(
            "resume no".parse::<Command>().unwrap(),
            Command::Resume {
                should_resume: false
            }
        );
        assert_eq!("exit".parse::<Command>().unwrap(), Command::Quit);
        assert!("dance".parse::<Command>().is_err());
        assert!("play now".parse::<Command>().is_err());
    }

    #[test]
    fn option_choice_is_one_based() {
        let options = SleepDuration::standard_options();
        assert_eq!(parse_option_choice("1", &options), Some(SleepDuration::Off));
        assert_eq!(parse_option_choice(" 6 ", &options), Some(SleepDuration::Minutes(20)));
        assert_eq!(parse_option_choice("0", &options), None);
        assert_eq!(parse_option_choice("99", &options), None);
        assert_eq!(parse_option_choice("", &options), None);
    }

    #[tokio::test]
    async fn router_prefers_waiting_question() {
        let router = PromptRouter::default();
        assert_eq!(router.route("play".into()), Some("play".into()));

        let answer = router.ask();
        assert_eq!(router.route("3".into()), None);
        assert_eq!(answer.await.unwrap(), "3");
        assert_eq!(router.route("rows".into()), Some("rows".into()));
    }

    #[tokio::test]
    async fn presenter_reads_routed_answers() {
        let router = PromptRouter::default();
        let presenter = TerminalPresenter::new(router.clone());

        let pick = tokio::spawn(async move {
            presenter
                .present_time_picker(Some(AlarmTime::default()))
                .await
        });
        while router.route("6:15".into()).is_some() {
            tokio::task::yield_now().await;
        }
        assert_eq!(pick.await.unwrap(), Some(AlarmTime::new(6, 15).unwrap()));
    }
}
