use std::fs;
use std::path::PathBuf;

use clap::{ArgAction, Parser, Subcommand};

use pillbox::error::{ErrorCategory, ErrorKind, PillboxError, Result};
use pillbox::store::VersionStore;
use pillbox::{armor, ops, passphrase};

#[derive(Parser, Debug)]
#[command(
    name = "pillbox",
    version,
    about = "a password-sealed single-value store with revert"
)]
struct Cli {
    /// Directory holding the store's data files
    #[arg(long = "data-dir", default_value = ".pillbox", global = true)]
    data_dir: PathBuf,

    /// Read passphrase from stdin instead of from terminal
    #[arg(long = "passphrase-stdin", action = ArgAction::SetTrue, global = true)]
    passphrase_stdin: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seal a new value and make it the current version
    Set {
        /// The text to store
        #[arg(required_unless_present = "input")]
        text: Option<String>,
        /// Read the text from a file instead
        #[arg(short = 'i', long = "input", conflicts_with = "text")]
        input: Option<PathBuf>,
    },
    /// Print the current value
    Get {
        /// Also print the armored pill
        #[arg(long, action = ArgAction::SetTrue)]
        pill: bool,
    },
    /// Check the current value against its pill
    Verify,
    /// Replace the current value with the previous version
    Revert,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    if let Err(err) = run(cli) {
        eprintln!("{}", err);
        if matches!(
            err.kind,
            Some(ErrorKind::TamperDetected) | Some(ErrorKind::PlaintextMismatch)
        ) {
            eprintln!("run 'pillbox revert' to restore the previous version");
        }
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<()> {
    let mut store = VersionStore::open(&cli.data_dir);

    let mut reader: Box<dyn passphrase::PassphraseReader> = if cli.passphrase_stdin {
        Box::new(passphrase::ReaderPassphraseReader::new(Box::new(
            std::io::stdin(),
        )))
    } else {
        Box::new(passphrase::TerminalPassphraseReader::new())
    };

    match cli.command {
        Commands::Set { text, input } => {
            let value = match (text, input) {
                (Some(text), _) => text,
                (None, Some(path)) => fs::read_to_string(&path).map_err(|e| {
                    PillboxError::with_kind_and_source(
                        ErrorCategory::User,
                        ErrorKind::Io,
                        format!("failed to read {}", path.display()),
                        e,
                    )
                })?,
                // clap enforces that one of the two is present.
                (None, None) => {
                    return Err(PillboxError::new(
                        ErrorCategory::User,
                        "either a text argument or --input is required",
                    ))
                }
            };
            ops::submit(&mut store, reader.as_mut(), &value)?;
            Ok(())
        }
        Commands::Get { pill } => {
            let snapshot = ops::fetch(&store)?;
            println!("{}", snapshot.plaintext);
            if pill {
                println!("{}", armor::wrap(&snapshot.envelope));
            }
            Ok(())
        }
        Commands::Verify => {
            ops::verify(&store, reader.as_mut())?;
            println!("data is intact");
            Ok(())
        }
        Commands::Revert => {
            match ops::revert(&mut store)? {
                Some(snapshot) => println!("{}", snapshot.plaintext),
                None => {
                    eprintln!("no previous version exists; the store was reset to an empty state")
                }
            }
            Ok(())
        }
    }
}
