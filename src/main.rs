use std::ops::ControlFlow;
use std::path::PathBuf;

use masss::{skip_from_filename, AppConfig, InstanceId, Sampler};
use tokio::io::{AsyncBufReadExt, BufReader};

/// One line typed on the console.
#[derive(Debug, Clone, PartialEq)]
enum Command {
  Play(String),
  Stop(InstanceId),
  Volume(f64),
  Modifier(InstanceId, f64),
  Equalizer(String),
  Skip(Option<u32>),
  Status,
  Quit,
}

const HELP: &str = "commands: play <file> | stop <id> | vol <0-1.25> | mod <id> <0-2> | \
                    eq <10 gains> | skip <secs|off> | status | quit";

impl Command {
  fn parse(line: &str) -> Result<Self, String> {
    let (verb, rest) = line
      .split_once(char::is_whitespace)
      .map(|(v, r)| (v, r.trim()))
      .unwrap_or((line, ""));

    match verb {
      "play" if !rest.is_empty() => Ok(Command::Play(rest.to_string())),
      "stop" => parse_id(rest).map(Command::Stop),
      "vol" => parse_number(rest).map(Command::Volume),
      "mod" => {
        let (id, value) = rest
          .split_once(char::is_whitespace)
          .ok_or_else(|| "usage: mod <id> <0-2>".to_string())?;
        let value = parse_number(value.trim())?;
        if !(0.0..=2.0).contains(&value) {
          return Err(format!("Modifier must be between 0 and 2, got {}", value));
        }
        Ok(Command::Modifier(parse_id(id)?, value))
      }
      "eq" => Ok(Command::Equalizer(rest.to_string())),
      "skip" if rest == "off" => Ok(Command::Skip(None)),
      "skip" => rest
        .parse::<u32>()
        .map(|s| Command::Skip(Some(s)))
        .map_err(|_| format!("Invalid skip: {}", rest)),
      "status" => Ok(Command::Status),
      "quit" | "exit" => Ok(Command::Quit),
      _ => Err(HELP.to_string()),
    }
  }
}

fn parse_id(s: &str) -> Result<InstanceId, String> {
  s.trim()
    .trim_start_matches('#')
    .parse::<usize>()
    .map(InstanceId)
    .map_err(|_| format!("Invalid instance id: {}", s))
}

fn parse_number(s: &str) -> Result<f64, String> {
  s.parse::<f64>().map_err(|_| format!("Invalid number: {}", s))
}

async fn execute(sampler: &Sampler, command: Command) -> Result<ControlFlow<()>, String> {
  match command {
    Command::Play(file) => {
      let skip = skip_from_filename(&file);
      let name = file.clone();
      let id = sampler
        .play(&file, skip, move || println!("finished {}", name))
        .await
        .map_err(|e| e.to_string())?;
      println!("playing {} on {}", file, id);
    }
    Command::Stop(id) => sampler.stop(id).await.map_err(|e| e.to_string())?,
    Command::Volume(volume) => sampler
      .set_master_volume(volume)
      .await
      .map_err(|e| e.to_string())?,
    Command::Modifier(id, modifier) => sampler
      .set_volume_modifier(id, modifier)
      .await
      .map_err(|e| e.to_string())?,
    Command::Equalizer(bands) => sampler
      .set_equalizer(&bands)
      .await
      .map_err(|e| e.to_string())?,
    Command::Skip(seconds) => sampler
      .set_skip_override(seconds)
      .await
      .map_err(|e| e.to_string())?,
    Command::Status => {
      let status = sampler.status().await.map_err(|e| e.to_string())?;
      let json = serde_json::to_string_pretty(&status).map_err(|e| e.to_string())?;
      println!("{}", json);
    }
    Command::Quit => return Ok(ControlFlow::Break(())),
  }
  Ok(ControlFlow::Continue(()))
}

#[tokio::main]
async fn main() {
  env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

  let config_path: Option<PathBuf> = match AppConfig::default_path() {
    Ok(path) => Some(path),
    Err(e) => {
      log::warn!("Settings will not be persisted: {}", e);
      None
    }
  };
  let config = config_path
    .as_deref()
    .map(AppConfig::load)
    .unwrap_or_default();

  let sampler = match Sampler::start(config).await {
    Ok(sampler) => sampler,
    Err(e) => {
      log::error!("Failed to start engine pool: {}", e);
      std::process::exit(1);
    }
  };
  println!("{}", HELP);

  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = tokio::select! {
      line = lines.next_line() => line,
      _ = tokio::signal::ctrl_c() => {
        log::info!("Interrupted");
        break;
      }
    };
    let line = match line {
      Ok(Some(line)) => line,
      Ok(None) => break,
      Err(e) => {
        log::error!("Failed to read console input: {}", e);
        break;
      }
    };
    if line.trim().is_empty() {
      continue;
    }

    let result = match Command::parse(line.trim()) {
      Ok(command) => execute(&sampler, command).await,
      Err(e) => Err(e),
    };
    match result {
      Ok(ControlFlow::Break(())) => break,
      Ok(ControlFlow::Continue(())) => {}
      Err(e) => println!("error: {}", e),
    }
  }

  sampler.begin_shutdown().await;

  if let Some(path) = config_path {
    if let Err(e) = sampler.settings().save(&path) {
      log::error!("Failed to save settings: {}", e);
    }
  }
}
