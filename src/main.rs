use beads::cli::{commands, Cli, Commands};
use beads::config::CliOverrides;
use beads::logging::init_logging;
use beads::BeadsError;
use clap::Parser;
use std::io::IsTerminal;

fn main() {
    let cli = Cli::parse();

    if let Err(e) = init_logging(cli.verbose, cli.quiet) {
        eprintln!("Failed to initialize logging: {e}");
    }

    let overrides = CliOverrides {
        db: cli.db.clone(),
        actor: cli.actor.clone(),
        json: cli.json,
        no_daemon: cli.no_daemon,
        no_auto_flush: cli.no_auto_flush,
        no_auto_import: cli.no_auto_import,
    };

    let result = match cli.command {
        Commands::Init { prefix } => commands::init::execute(prefix, &overrides),
        Commands::Create(args) => commands::create::execute(args, cli.json, &overrides),
        Commands::Update(args) => commands::issue::update(&args, cli.json, &overrides),
        Commands::Close(args) => commands::issue::close(&args, cli.json, &overrides),
        Commands::Show { id, events } => commands::issue::show(&id, events, cli.json, &overrides),
        Commands::List(args) => commands::list::execute(&args, cli.json, &overrides),
        Commands::Dep { command } => commands::dep::execute(&command, &overrides),
        Commands::Label { command } => commands::label::execute(&command, &overrides),
        Commands::Config { command } => commands::config::execute(&command, cli.json, &overrides),
        Commands::Import(args) => commands::import::execute(&args, cli.json, &overrides),
        Commands::Export(args) => commands::export::execute(&args, cli.json, &overrides),
        Commands::Sync => commands::sync::execute(&overrides),
        Commands::Validate { fix } => commands::validate::execute(fix, cli.json, &overrides),
        Commands::Daemon { command } => commands::daemon::execute(&command, cli.json, &overrides),
    };

    if let Err(e) = result {
        handle_error(&e, cli.json);
    }
}

/// Render an error and exit non-zero.
fn handle_error(err: &BeadsError, json_mode: bool) -> ! {
    if json_mode || !std::io::stdout().is_terminal() {
        eprintln!(
            "{}",
            serde_json::to_string_pretty(&err.to_json()).unwrap_or_else(|_| err.to_string())
        );
    } else {
        eprintln!("Error: {err}");
        if let Some(hint) = err.suggestion() {
            eprintln!("Hint: {hint}");
        }
    }
    std::process::exit(err.exit_code());
}
