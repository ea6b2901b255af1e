use std::process::ExitCode;

use anyhow::Context as _;
use clap::Parser as _;

use lifebook::app::model::AddTurnRequest;
use lifebook::app::service::LifebookService;
use lifebook::cli::{Cli, Command, PlanCommand};
use lifebook::config::Settings;
use lifebook::orchestrator::GenerateOptions;

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(err) = try_main().await {
        eprintln!("{err:#}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}

async fn try_main() -> anyhow::Result<()> {
    lifebook::logging::init().context("init logging")?;

    let cli = Cli::parse();
    tracing::debug!(?cli, "parsed cli");

    let settings = Settings::from_env()
        .context("load settings")?
        .with_data_dir(cli.data_dir);
    let service = LifebookService::from_settings(&settings).context("build service")?;

    match cli.command {
        Command::Turn(args) => {
            let response = service
                .add_turn(
                    &args.session,
                    AddTurnRequest {
                        user_id: args.user,
                        text: args.text,
                        era: args.era,
                        topic: args.topic,
                    },
                )
                .await
                .context("turn")?;
            print_json(&response)?;
        }
        Command::CompleteSession(args) => {
            let session = service
                .complete_session(&args.user, &args.session)
                .await
                .context("complete session")?;
            println!(
                "session {} complete ({} utterances)",
                session.session_id,
                session.utterances.len()
            );
        }
        Command::Extract(args) => {
            let outcome = service
                .extract_now(&args.user, &args.session)
                .await
                .context("extract")?;
            print_json(&outcome)?;
        }
        Command::Generate(args) => {
            let stats = service
                .generate_book(
                    &args.user,
                    GenerateOptions {
                        relaxed: args.relaxed,
                        resume: args.resume,
                    },
                )
                .await
                .context("generate")?;
            print_json(&stats)?;
        }
        Command::Status(args) => {
            let book = service.book(&args.user).await.context("status")?;
            print_json(&book)?;
        }
        Command::Access(args) => {
            let decision = service.check_access(&args.user, &args.endpoint).await;
            print_json(&decision)?;
            if !decision.allowed {
                anyhow::bail!(
                    "access denied ({}) for {} on {}",
                    decision.status_code(),
                    args.user,
                    args.endpoint
                );
            }
        }
        Command::Grant(args) => {
            let account = service
                .grant(&args.user, !args.revoke)
                .await
                .context("grant")?;
            print_json(&account)?;
        }
        Command::Plan {
            command: PlanCommand::Discard(args),
        } => {
            service
                .discard_plan(&args.user)
                .await
                .context("plan discard")?;
        }
        Command::Plan {
            command: PlanCommand::MarkErroneous(args),
        } => {
            service
                .mark_plan_erroneous(&args.user)
                .await
                .context("plan mark-erroneous")?;
        }
    }

    Ok(())
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    let json = serde_json::to_string_pretty(value).context("serialize output")?;
    println!("{json}");
    Ok(())
}
