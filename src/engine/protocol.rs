//! Engine remote-control (RC) line protocol.
//!
//! Commands are single ASCII lines terminated by `\n`. Responses are free text
//! prefixed with `> ` prompts and interleaved with engine log lines.

use std::fmt;

/// Prompt marker printed by the engine before each response.
const PROMPT: &str = "> ";

/// Command sent to the engine over the control socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
  /// Set the output volume (engine units, 256 = 100%).
  Volume(i64),
  /// Enqueue a file and start playing it.
  Add(String),
  /// Jump to an absolute position in whole seconds.
  Seek(u32),
  /// Ask for the length of the current track in seconds.
  GetLength,
  /// Stop playback.
  Stop,
  /// Quit the engine process.
  Shutdown,
}

impl EngineCommand {
  /// Encode as a wire line, including the trailing newline.
  pub fn encode(&self) -> Vec<u8> {
    format!("{}\n", self).into_bytes()
  }
}

impl fmt::Display for EngineCommand {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EngineCommand::Volume(v) => write!(f, "volume {}", v),
      EngineCommand::Add(path) => write!(f, "add {}", path),
      EngineCommand::Seek(secs) => write!(f, "seek {}", secs),
      EngineCommand::GetLength => f.write_str("get_length"),
      EngineCommand::Stop => f.write_str("stop"),
      EngineCommand::Shutdown => f.write_str("shutdown"),
    }
  }
}

/// Extract the track length from a `get_length` response.
///
/// The engine may interleave log lines with the answer, and reports `0` while a
/// track is still being opened. Returns the first line that is a nonzero
/// integer, or `None` if there is none.
pub fn parse_length(raw: &str) -> Option<u64> {
  for line in raw.split('\n') {
    let candidate = strip_prompts(line);
    match candidate.parse::<u64>() {
      Ok(0) => log::debug!("Engine reported a zero track length, skipping"),
      Ok(length) => return Some(length),
      Err(_) => {}
    }
  }
  None
}

/// Remove prompt markers and carriage returns from engine output.
pub fn strip_prompts(raw: &str) -> String {
  raw
    .replace("\r\n", "\n")
    .replace(&format!("\n{}", PROMPT), "\n")
    .replace(PROMPT, "")
    .trim()
    .to_string()
}
