use std::io::Write;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info};
use yubikey_device_kit::DeviceKit;
use yubikey_evm_workshop::adapter::{Adapter, Collaborators};
use yubikey_evm_workshop::config::Cli;
use yubikey_evm_workshop::console::{Command, HELP, Outcome};
use yubikey_evm_workshop::{logging, view};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    logging::init_logging(cli.verbose);

    if let Err(err) = run(&cli).await {
        error!(error = %format!("{err:#}"), "workshop failed");
        std::process::exit(1);
    }
}

async fn run(cli: &Cli) -> Result<()> {
    let config = cli.resolve().context("failed to load configuration")?;
    info!(readers = ?config.reader_filters, "starting workshop");

    let kit = DeviceKit::pcsc(config.reader_filters.clone(), config.kit_options());
    let (mut adapter, mut events) = Adapter::new(Collaborators::from_kit(kit), &config);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    println!("{HELP}\n");
    print_page(&adapter)?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match line.parse::<Command>() {
                    Ok(command) => match command.execute(&mut adapter) {
                        Outcome::Render => print_page(&adapter)?,
                        Outcome::Notice(notice) => println!("{notice}\n"),
                        Outcome::Quit => break,
                    },
                    Err(err) => println!("{err}\n"),
                }
            }
            Some(event) = events.recv() => {
                adapter.apply(event);
                print_page(&adapter)?;
            }
        }
    }

    info!("bye");
    Ok(())
}

fn print_page(adapter: &Adapter) -> Result<()> {
    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{}", view::render(adapter.state())).context("failed to write page")?;
    stdout.flush().context("failed to flush stdout")
}
