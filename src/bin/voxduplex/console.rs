//! Console front end: prints state changes and events, reads line commands
//! from stdin.

use crossbeam_channel::{bounded, select, Receiver, Sender};
use serde_json::json;
use std::io::{self, BufRead};
use std::thread;
use voxduplex::service::HistoryEntry;
use voxduplex::stages::GenerationStage;
use voxduplex::{Pipeline, PipelineEvent, TurnState};

const COMMAND_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Command {
    Interrupt,
    History,
    Quit,
    Unknown(String),
}

pub(crate) fn parse_command(line: &str) -> Option<Command> {
    let word = line.trim().to_ascii_lowercase();
    match word.as_str() {
        "" => None,
        "i" | "interrupt" | "stop" => Some(Command::Interrupt),
        "h" | "history" => Some(Command::History),
        "q" | "quit" | "exit" => Some(Command::Quit),
        _ => Some(Command::Unknown(line.trim().to_string())),
    }
}

/// Read stdin on its own thread. End of input counts as `quit`.
pub(crate) fn spawn_command_reader() -> io::Result<Receiver<Command>> {
    let (tx, rx) = bounded(COMMAND_CHANNEL_CAPACITY);
    thread::Builder::new()
        .name("voxduplex-stdin".into())
        .spawn(move || read_commands(io::stdin().lock(), &tx))?;
    Ok(rx)
}

fn read_commands(input: impl BufRead, tx: &Sender<Command>) {
    for line in input.lines() {
        let Ok(line) = line else {
            break;
        };
        if let Some(command) = parse_command(&line) {
            if tx.send(command).is_err() {
                return;
            }
        }
    }
    let _ = tx.send(Command::Quit);
}

pub(crate) fn render_state(state: TurnState, json_events: bool) -> String {
    if json_events {
        json!({ "event": "state", "state": state }).to_string()
    } else {
        format!("[{}]", state.label())
    }
}

/// Text line for an event, or `None` when the plain console skips it.
pub(crate) fn render_event(event: &PipelineEvent, json_events: bool) -> Option<String> {
    if json_events {
        return serde_json::to_string(event).ok();
    }
    match event {
        PipelineEvent::AssistantText { text, .. } => Some(format!("assistant: {text}")),
        PipelineEvent::SpeechEnded { duration_ms, .. } => {
            Some(format!("you: <{:.1}s of audio>", *duration_ms as f64 / 1000.0))
        }
        PipelineEvent::TurnEnded {
            error: Some(error), ..
        } => Some(format!("error: {error}")),
        PipelineEvent::CaptureFailed { message } => Some(format!("microphone failed: {message}")),
        _ => None,
    }
}

pub(crate) fn render_history(history: &[HistoryEntry]) -> Vec<String> {
    if history.is_empty() {
        return vec!["(no conversation yet)".to_string()];
    }
    history
        .iter()
        .enumerate()
        .map(|(idx, entry)| match entry {
            HistoryEntry::UserAudio(audio) => format!(
                "{:>3} {}: <{:.1}s of audio>",
                idx + 1,
                entry.role(),
                audio.duration.as_secs_f64()
            ),
            HistoryEntry::UserText(text) | HistoryEntry::AssistantText(text) => {
                format!("{:>3} {}: {text}", idx + 1, entry.role())
            }
        })
        .collect()
}

/// Drive the console until `quit` or end of input.
pub(crate) fn run(
    pipeline: &Pipeline,
    brain: &GenerationStage,
    states: Receiver<TurnState>,
    events: Receiver<PipelineEvent>,
    commands: Receiver<Command>,
    json_events: bool,
) {
    loop {
        select! {
            recv(states) -> state => {
                if let Ok(state) = state {
                    println!("{}", render_state(state, json_events));
                }
            }
            recv(events) -> event => {
                if let Some(line) = event.ok().and_then(|e| render_event(&e, json_events)) {
                    println!("{line}");
                }
            }
            recv(commands) -> command => match command {
                Ok(Command::Interrupt) => pipeline.interrupt(),
                Ok(Command::History) => {
                    for line in render_history(&brain.history()) {
                        println!("{line}");
                    }
                }
                Ok(Command::Unknown(word)) => {
                    eprintln!("unknown command '{word}' (interrupt | history | quit)");
                }
                Ok(Command::Quit) | Err(_) => return,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::time::Duration;
    use voxduplex::audio::EncodedUtterance;

    #[test]
    fn parses_commands_and_aliases() {
        assert_eq!(parse_command("  interrupt "), Some(Command::Interrupt));
        assert_eq!(parse_command("STOP"), Some(Command::Interrupt));
        assert_eq!(parse_command("h"), Some(Command::History));
        assert_eq!(parse_command("exit"), Some(Command::Quit));
        assert_eq!(parse_command("   "), None);
        assert_eq!(
            parse_command("louder"),
            Some(Command::Unknown("louder".into()))
        );
    }

    #[test]
    fn end_of_input_quits() {
        let (tx, rx) = bounded(8);
        read_commands(Cursor::new("history\n\nnope\n"), &tx);
        let commands: Vec<Command> = rx.try_iter().collect();
        assert_eq!(
            commands,
            vec![
                Command::History,
                Command::Unknown("nope".into()),
                Command::Quit
            ]
        );
    }

    #[test]
    fn json_output_is_one_object_per_line() {
        assert_eq!(
            render_state(TurnState::UserSpeaking, true),
            r#"{"event":"state","state":"user_speaking"}"#
        );
        let line = render_event(&PipelineEvent::PlaybackInterrupted, true).unwrap();
        assert_eq!(line, r#"{"event":"playback_interrupted"}"#);
    }

    #[test]
    fn plain_output_shows_conversation_lines() {
        assert_eq!(render_state(TurnState::Listening, false), "[listening]");
        assert_eq!(
            render_event(
                &PipelineEvent::AssistantText {
                    session: 1,
                    text: "Hello".into()
                },
                false
            )
            .as_deref(),
            Some("assistant: Hello")
        );
        assert!(render_event(&PipelineEvent::TurnStarted { session: 1 }, false).is_none());
    }

    #[test]
    fn history_lines_label_roles() {
        let audio = EncodedUtterance::from_wav(&[], 16_000, 10, 0, 10, Duration::from_millis(1_500));
        let lines = render_history(&[
            HistoryEntry::UserAudio(audio),
            HistoryEntry::AssistantText("Hi!".into()),
        ]);
        assert_eq!(lines, vec!["  1 user: <1.5s of audio>", "  2 assistant: Hi!"]);
        assert_eq!(render_history(&[]), vec!["(no conversation yet)"]);
    }
}
