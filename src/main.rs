use clap::{Parser, Subcommand};
use gitpersona::app::{App, SwitchRequest};
use gitpersona::errors::PersonaError;
use gitpersona::managers::switch::TransactionOptions;
use serde::Serialize;

/// Isolated per-account GitHub credentials
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Switch SSH agent, token and Git identity to an account
    Switch {
        alias: String,
        /// Account to restore on rollback (defaults to the current account)
        #[arg(long = "from", value_name = "ALIAS")]
        from: Option<String>,
        #[arg(long)]
        no_token_check: bool,
        /// Print shell exports for the new binding instead of JSON
        #[arg(long)]
        print_env: bool,
    },
    /// Show tracked agents and stored tokens
    Status,
    /// Stop every agent and remove orphaned sockets
    Cleanup,
    /// Check an account's configuration, key and token without changing them
    Validate {
        alias: String,
        /// Also test SSH authentication against GitHub
        #[arg(long)]
        remote: bool,
    },
    #[command(subcommand)]
    Token(TokenCommand),
}

#[derive(Subcommand, Debug)]
enum TokenCommand {
    Store {
        alias: String,
        #[arg(long)]
        token: String,
        /// GitHub login the token belongs to (resolved via the API if omitted)
        #[arg(long)]
        username: Option<String>,
    },
    Validate {
        alias: String,
        /// Also ask GitHub who owns the token
        #[arg(long)]
        remote: bool,
    },
    Delete {
        alias: String,
    },
}

fn print_json<T: Serialize>(value: &T) -> Result<(), PersonaError> {
    let text = serde_json::to_string_pretty(value)
        .map_err(|err| PersonaError::internal(format!("Failed to render output: {}", err)))?;
    println!("{}", text);
    Ok(())
}

async fn run(cli: Cli) -> Result<bool, PersonaError> {
    let app = App::initialize()?;
    match cli.command {
        Command::Switch {
            alias,
            from,
            no_token_check,
            print_env,
        } => {
            let request = SwitchRequest {
                target: alias,
                source: from,
                skip_token_validation: no_token_check,
                repo_dir: std::env::current_dir().ok(),
            };
            let result = app.switch(request, TransactionOptions::default()).await?;
            if print_env && result.success {
                println!("{}", result.binding.shell_exports());
            } else {
                print_json(&result)?;
            }
            Ok(result.success)
        }
        Command::Status => {
            print_json(&app.status()?)?;
            Ok(true)
        }
        Command::Cleanup => {
            let report = app.cleanup().await;
            print_json(&report)?;
            Ok(report.errors.is_empty())
        }
        Command::Validate { alias, remote } => {
            let report = app.validate_account(&alias, remote).await?;
            print_json(&report)?;
            Ok(!report.has_errors())
        }
        Command::Token(TokenCommand::Store {
            alias,
            token,
            username,
        }) => {
            print_json(&app.store_token(&alias, &token, username).await?)?;
            Ok(true)
        }
        Command::Token(TokenCommand::Validate { alias, remote }) => {
            print_json(&app.validate_token(&alias, remote).await?)?;
            Ok(true)
        }
        Command::Token(TokenCommand::Delete { alias }) => {
            let removed = app.delete_token(&alias)?;
            print_json(&serde_json::json!({"account": alias, "removed": removed}))?;
            Ok(true)
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    match run(cli).await {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(err) => {
            let _ = print_json(&err);
            eprintln!("gitpersona: {}", err);
            std::process::exit(1);
        }
    }
}
