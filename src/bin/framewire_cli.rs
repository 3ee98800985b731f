use std::{
    error::Error,
    io::{self, Write},
    process,
};

use clap::Parser;
use framewire::{Delimiter, Session, ShellCommand, prompt};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    address: String,
    /// Server port
    port: u16,
}

fn main() -> Result<(), Box<dyn Error>> {
    // Initialize env_logger; For logging to STDOUT/STDERR
    env_logger::init();

    let cli = Cli::parse();
    let mut session = Session::connect(&cli.address, cli.port)?;

    let interrupter = session.interrupter()?;
    ctrlc::set_handler(move || {
        println!();
        interrupter.interrupt();
        process::exit(0);
    })?;

    println!("connected to {}", session.info());
    println!("commands: exit, multiline (end requests with '#'), recover");

    let mut stdin = io::stdin().lock();
    let mut stdout = io::stdout();
    let mut delimiter = Delimiter::Newline;

    loop {
        let Some(command) = prompt(&mut stdin, &mut stdout, delimiter)? else {
            break;
        };

        match command {
            ShellCommand::Exit => break,
            ShellCommand::Multiline => {
                println!("multiline mode: finish each request with '#'");
                delimiter = Delimiter::Hash;
            }
            ShellCommand::Recover => {
                println!("single-line mode: finish each request with Enter");
                delimiter = Delimiter::Newline;
            }
            ShellCommand::Message(data) => match session.request(data.as_bytes()) {
                Ok(response) => {
                    writeln!(stdout, "Response: {}", String::from_utf8_lossy(&response))?;
                }
                Err(e) => {
                    eprintln!("Connection error: {e}");
                    session.close();
                    process::exit(1);
                }
            },
        }
    }

    session.close();
    Ok(())
}
