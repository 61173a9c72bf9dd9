//! AppMarket CLI - sign in, manage your profile and buy plans.

mod commands;
mod output;
mod session_file;

use anyhow::Result;
use clap::{Parser, Subcommand};
use market_config::{Config, Paths};
use tracing::debug;

/// AppMarket CLI - Account, profile and subscription management.
#[derive(Parser)]
#[command(name = "appmarket")]
#[command(about = "AppMarket CLI for accounts, profiles and subscriptions")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Use the in-memory demo backend instead of Supabase
    #[arg(long, env = "APPMARKET_DEMO", global = true)]
    demo: bool,

    /// Output format (text or json)
    #[arg(short, long, default_value = "text", global = true)]
    format: output::OutputFormat,

    /// Log level (trace, debug, info, warn, error); defaults to the config file
    #[arg(long, global = true)]
    log_level: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the signed-in account
    Status,

    /// Sign in with email and password
    SignIn {
        /// Account email
        #[arg(short, long)]
        email: Option<String>,
        /// Password; prompted for when omitted
        #[arg(long, env = "APPMARKET_PASSWORD", hide_env_values = true)]
        password: Option<String>,
    },

    /// Create an account
    SignUp {
        /// Account email
        #[arg(short, long)]
        email: Option<String>,
        /// Password; prompted for when omitted
        #[arg(long, env = "APPMARKET_PASSWORD", hide_env_values = true)]
        password: Option<String>,
        /// Display name stored on the profile
        #[arg(short = 'n', long)]
        full_name: Option<String>,
    },

    /// Sign out and clear the saved session
    SignOut,

    /// Show or edit your profile
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// List subscription plans
    Plans,

    /// Buy a plan or an app
    Checkout {
        /// Plan id (see `appmarket plans`)
        #[arg(conflicts_with = "app")]
        plan: Option<String>,
        /// App id for a one-time purchase
        #[arg(long)]
        app: Option<String>,
    },

    /// Finish a checkout from the URL the provider redirected to
    Return {
        /// Return URL or query string
        url: String,
    },

    /// Show your current subscription
    Subscription,

    /// Cancel a subscription
    Cancel {
        /// Provider subscription id
        subscription_id: String,
        /// Skip the confirmation prompt
        #[arg(short, long)]
        yes: bool,
    },
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show profile details
    Show,
    /// Update profile fields
    Update {
        /// New display name
        #[arg(long)]
        full_name: Option<String>,
        /// New avatar URL
        #[arg(long)]
        avatar_url: Option<String>,
    },
}

async fn run(command: Commands, ctx: &commands::Context) -> Result<()> {
    match command {
        Commands::Status => commands::status(ctx).await,
        Commands::SignIn { email, password } => commands::sign_in(ctx, email, password).await,
        Commands::SignUp {
            email,
            password,
            full_name,
        } => commands::sign_up(ctx, email, password, full_name).await,
        Commands::SignOut => commands::sign_out(ctx).await,
        Commands::Profile { command } => match command {
            ProfileCommands::Show => commands::profile_show(ctx).await,
            ProfileCommands::Update {
                full_name,
                avatar_url,
            } => commands::profile_update(ctx, full_name, avatar_url).await,
        },
        Commands::Plans => commands::plans(ctx).await,
        Commands::Checkout { plan, app } => commands::checkout(ctx, plan, app).await,
        Commands::Return { url } => commands::reconcile_return(ctx, &url).await,
        Commands::Subscription => commands::subscription(ctx).await,
        Commands::Cancel {
            subscription_id,
            yes,
        } => commands::cancel(ctx, &subscription_id, yes).await,
    }
}

async fn execute(cli: Cli, paths: Paths, config: Config) -> Result<()> {
    let ctx = commands::Context::open(&config, &paths, cli.demo, cli.format).await?;
    let result = run(cli.command.unwrap_or(Commands::Status), &ctx).await;
    let closed = ctx.close().await;
    result.and(closed)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let loaded = Paths::new().and_then(|paths| Config::load(&paths).map(|config| (paths, config)));
    let (paths, config) = match loaded {
        Ok(loaded) => loaded,
        Err(e) => {
            output::print_error(&e.to_string(), cli.format);
            std::process::exit(1);
        }
    };

    let level = cli.log_level.clone().unwrap_or_else(|| config.log_level.clone());
    market_config::init_logging_for_service("cli", &level);
    debug!(demo = cli.demo, "CLI started");

    let format = cli.format;
    if let Err(e) = execute(cli, paths, config).await {
        output::print_error(&e.to_string(), format);
        std::process::exit(1);
    }
}
