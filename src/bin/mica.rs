//! An interactive client for a local mica store.

use std::path::PathBuf;

use clap::Parser;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use simplelog::{ColorChoice, TermLogger, TerminalMode};

use mica::{Bitcask, Region};

#[derive(Parser)]
#[command(about = "An embedded Bitcask-style key-value store", version)]
struct Args {
    /// Database directory.
    #[arg(default_value = "./mica")]
    path: PathBuf,

    /// Open the store read-only.
    #[arg(long)]
    read_only: bool,

    /// Fsync the active file after every put.
    #[arg(long)]
    sync_on_put: bool,

    /// Size at which the active file rotates, in bytes.
    #[arg(long, default_value_t = 1 << 30)]
    max_file_size: u64,

    /// Capacity of the memory region backing the store, in bytes.
    #[arg(long, default_value_t = 256 << 20)]
    region_size: usize,

    /// Logging level (off, error, warn, info, debug, trace).
    #[arg(long, default_value = "info")]
    log_level: log::LevelFilter,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    TermLogger::init(
        args.log_level,
        simplelog::Config::default(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let region = Region::with_capacity(args.region_size);
    let mut db = mica::Config::default()
        .read_write(!args.read_only)
        .sync_on_put(args.sync_on_put)
        .max_file_size(args.max_file_size)
        .open(&region, &args.path)?;

    let mut editor = DefaultEditor::new()?;
    loop {
        let line = match editor.readline("mica> ") {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => return Err(err.into()),
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);
        if line == "quit" || line == "exit" {
            break;
        }
        match execute(&mut db, line) {
            Ok(output) => println!("{output}"),
            Err(err) => eprintln!("Error: {err}"),
        }
    }
    Ok(())
}

fn execute(db: &mut Bitcask<'_>, line: &str) -> mica::Result<String> {
    let mut parts = line.splitn(3, char::is_whitespace);
    let command = parts.next().unwrap_or_default();
    let output = match (command, parts.next(), parts.next()) {
        ("get", Some(key), None) => match db.get(key.as_bytes())? {
            Some(value) => String::from_utf8_lossy(&value).into_owned(),
            None => "(not found)".to_string(),
        },
        ("put", Some(key), Some(value)) => {
            db.put(key.as_bytes(), value.as_bytes())?;
            "OK".to_string()
        }
        ("del", Some(key), None) => {
            if db.delete(key.as_bytes())? {
                "OK".to_string()
            } else {
                "(not found)".to_string()
            }
        }
        ("merge", None, None) => {
            db.merge()?;
            "OK".to_string()
        }
        ("sync", None, None) => {
            db.sync()?;
            "OK".to_string()
        }
        _ => "commands: get KEY | put KEY VALUE | del KEY | merge | sync | quit".to_string(),
    };
    Ok(output)
}
