//! Line-oriented stdin console that forwards user commands to the bus.

use std::io::{self, BufRead};
use std::thread;

use log::{debug, info, warn};
use tokio::sync::broadcast::Sender;

use crate::protocol::{ControlCommand, Message};

const USAGE: &str = "commands: play <n>, select <n>, next, prev, toggle, pause, resume, \
seek <secs|+secs|-secs>, vol <0..1>, mute, shuffle, repeat, download <url>, \
reset-download, status, events, quit";

/// Parses one console line. Track numbers are 1-based as shown by `status`.
pub fn parse_command(line: &str) -> Result<ControlCommand, String> {
    let line = line.trim();
    let (verb, argument) = match line.split_once(char::is_whitespace) {
        Some((verb, rest)) => (verb, rest.trim()),
        None => (line, ""),
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "play" if argument.is_empty() => ControlCommand::Play,
        "play" => ControlCommand::PlayIndex(parse_track_number(argument)?),
        "select" => ControlCommand::SelectIndex(parse_track_number(argument)?),
        "next" | "n" => ControlCommand::Next,
        "prev" | "previous" | "p" => ControlCommand::Previous,
        "toggle" | "t" => ControlCommand::TogglePlay,
        "pause" => ControlCommand::Pause,
        "resume" => ControlCommand::Play,
        "seek" => parse_seek(argument)?,
        "vol" | "volume" => {
            let volume = argument
                .parse::<f32>()
                .map_err(|_| format!("invalid volume '{}'", argument))?;
            ControlCommand::SetVolume(volume)
        }
        "mute" => ControlCommand::ToggleMute,
        "shuffle" => ControlCommand::ToggleShuffle,
        "repeat" => ControlCommand::ToggleRepeat,
        "download" if argument.is_empty() => return Err("download needs a URL".to_string()),
        "download" => ControlCommand::Download(argument.to_string()),
        "reset-download" => ControlCommand::ResetDownload,
        "status" | "s" => ControlCommand::ShowStatus,
        "events" => ControlCommand::ShowEvents,
        "quit" | "exit" | "q" => ControlCommand::Quit,
        "" => return Err("empty command".to_string()),
        _ => return Err(format!("unknown command '{}'; {}", verb, USAGE)),
    };
    Ok(command)
}

fn parse_track_number(argument: &str) -> Result<usize, String> {
    match argument.parse::<usize>() {
        Ok(number) if number >= 1 => Ok(number - 1),
        _ => Err(format!("invalid track number '{}'", argument)),
    }
}

fn parse_seek(argument: &str) -> Result<ControlCommand, String> {
    let seconds = argument
        .parse::<f64>()
        .ok()
        .filter(|seconds| seconds.is_finite())
        .ok_or_else(|| format!("invalid seek position '{}'", argument))?;
    if argument.starts_with('+') || argument.starts_with('-') {
        Ok(ControlCommand::SeekRelative(seconds))
    } else {
        Ok(ControlCommand::Seek(seconds))
    }
}

/// Reads stdin on a worker thread. End of input requests shutdown.
pub fn spawn_console_reader(bus_producer: Sender<Message>) {
    let spawned = thread::Builder::new()
        .name("console".to_string())
        .spawn(move || {
            info!("Console: ready; {}", USAGE);
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!("Console: failed to read stdin: {}", err);
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Ok(command) => {
                        debug!("Console: {:?}", command);
                        if bus_producer.send(Message::Control(command)).is_err() {
                            return;
                        }
                    }
                    Err(message) => warn!("Console: {}", message),
                }
            }
            debug!("Console: stdin closed");
            let _ = bus_producer.send(Message::Shutdown);
        });
    if let Err(err) = spawned {
        warn!("Console: failed to spawn reader thread: {}", err);
    }
}
