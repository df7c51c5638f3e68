use std::io::{stdin, stdout, Write};
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use em8086::bios::render_text_screen;
use em8086::storage::JsonSectorStore;
use em8086::{Fat12, HaltReason, Session, SessionConfig};
use termion::input::TermRead;
use termion::raw::IntoRawMode;

/// Runs an 8086/DOS program against a persisted FAT12 floppy image.
#[derive(Parser)]
#[command(name = "dosrun", version, about)]
struct Cli {
    /// Path to the floppy image (JSON sector store; created if missing).
    floppy: PathBuf,

    /// COM or MZ program to load and run.
    program: PathBuf,

    /// Show a live register/flag dashboard while running.
    #[arg(long)]
    debug: bool,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let store = JsonSectorStore::open(&cli.floppy).unwrap_or_else(|e| {
        eprintln!("dosrun: could not open {}: {e}", cli.floppy.display());
        std::process::exit(1);
    });
    let mut fs = Fat12::new(store);
    if !fs.is_formatted() {
        log::info!("floppy image is blank, formatting a fresh FAT12 volume");
        fs.format("DOSRUN");
    }

    let image = std::fs::read(&cli.program).unwrap_or_else(|e| {
        eprintln!("dosrun: could not read {}: {e}", cli.program.display());
        std::process::exit(1);
    });

    let mut session = Session::new(fs, SessionConfig::default());
    if let Err(e) = session.load(&image) {
        eprintln!("dosrun: failed to load {}: {e}", cli.program.display());
        std::process::exit(1);
    }

    if cli.debug {
        run_with_dashboard(&mut session);
    } else {
        session.run(|_| {}, |_| false);
    }

    if let Err(e) = session.persist() {
        eprintln!("dosrun: failed to persist {}: {e}", cli.floppy.display());
        std::process::exit(1);
    }
}

fn run_with_dashboard(session: &mut Session<JsonSectorStore>) {
    let mut stdout = stdout().into_raw_mode().expect("terminal supports raw mode");
    write!(stdout, "{}", termion::clear::All).unwrap();

    session.run(
        |cpu| {
            write!(stdout, "{}{}\r\n{}", termion::cursor::Goto(1, 1), render_text_screen(cpu).replace('\n', "\r\n"), cpu).unwrap();
            stdout.flush().unwrap();
        },
        |cpu| {
            if let Some(Ok(termion::event::Key::Char(ch))) = stdin().keys().next() {
                cpu.keyboard.push(0, ch as u8);
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
            false
        },
    );

    match session.cpu().halt_reason {
        HaltReason::ProgramExit | HaltReason::Hlt => {
            write!(stdout, "{}\r\nprogram exited\r\n", termion::cursor::Goto(1, 6)).unwrap();
        }
        _ => {}
    }
}
