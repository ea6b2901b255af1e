use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct Cli {
    /// Root directory for persisted state (overrides LIFEBOOK_DATA_DIR).
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Append one utterance to an interview session.
    Turn(TurnArgs),
    /// Mark an interview session complete.
    CompleteSession(SessionArgs),
    /// Run fact extraction for one session now.
    Extract(SessionArgs),
    /// Plan, brief, and draft the whole book.
    Generate(GenerateArgs),
    /// Show generation state and committed chapters.
    Status(UserArgs),
    /// Ask the admission controller whether a call would be allowed.
    Access(AccessArgs),
    /// Set or revoke a user's paid entitlement.
    Grant(GrantArgs),
    Plan {
        #[command(subcommand)]
        command: PlanCommand,
    },
}

#[derive(Debug, Subcommand)]
pub enum PlanCommand {
    /// Delete the plan and its briefs so the next run plans again.
    Discard(UserArgs),
    /// Flag the plan as erroneous without deleting it.
    MarkErroneous(UserArgs),
}

#[derive(Debug, Args)]
pub struct UserArgs {
    #[arg(long)]
    pub user: String,
}

#[derive(Debug, Args)]
pub struct SessionArgs {
    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub session: String,
}

#[derive(Debug, Args)]
pub struct TurnArgs {
    #[arg(long)]
    pub user: String,

    #[arg(long)]
    pub session: String,

    /// Utterance text.
    #[arg(long)]
    pub text: String,

    /// Life period the session covers (e.g. "childhood").
    #[arg(long)]
    pub era: Option<String>,

    #[arg(long)]
    pub topic: Option<String>,
}

#[derive(Debug, Args)]
pub struct GenerateArgs {
    #[arg(long)]
    pub user: String,

    /// Accept incomplete sessions as long as one has content.
    #[arg(long, default_value_t = false)]
    pub relaxed: bool,

    /// Keep committed chapters and continue after them.
    #[arg(long, default_value_t = false)]
    pub resume: bool,
}

#[derive(Debug, Args)]
pub struct AccessArgs {
    #[arg(long)]
    pub user: String,

    /// Endpoint name (e.g. drafting-run, fact-extraction, transcription).
    #[arg(long)]
    pub endpoint: String,
}

#[derive(Debug, Args)]
pub struct GrantArgs {
    #[arg(long)]
    pub user: String,

    /// Remove the entitlement instead of granting it.
    #[arg(long, default_value_t = false)]
    pub revoke: bool,
}
