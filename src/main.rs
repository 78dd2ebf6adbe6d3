use anyhow::Result;
use clap::{Parser, ValueEnum};
use dotenv::dotenv;
use poise::serenity_prelude as serenity;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Age verification bot with a subscription-gated verified role
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Which components to run in this process
    #[arg(long, value_enum, default_value_t = Mode::All)]
    mode: Mode,

    /// Force re-sync of slash commands to all guilds (use when commands aren't showing up)
    #[arg(long, short = 's')]
    sync_commands: bool,

    /// Register commands per-guild instead of globally (faster for testing)
    #[arg(long)]
    guild_commands: bool,

    /// Specific guild ID to sync commands to (for testing)
    #[arg(long)]
    guild_id: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Bot, consumer and webhook receiver in one process
    All,
    /// Bot and consumer only
    Bot,
    /// Webhook receiver only
    Webhook,
}

mod commands;
mod config;
mod error;
mod events;
mod logging;
mod managers;
mod queue;
mod state;
mod web;

use commands::{
    get_subscription, get_verify_bot, help, ping, reverify, set_role, set_tier,
    subscription_status, update_tier, verification_logs, verifyme,
};
use config::AppConfig;
use events::{handle_guild_create, handle_member_add};
use managers::{
    DiscordRoleAssigner, KeyedLocks, SharedIdentityProvider, SharedRoleAssigner,
    SharedVerificationService, StripeIdentityClient, VerificationConsumer, VerificationService,
};
use queue::{InMemoryBroker, RedisStreamBroker, SharedBroker};
use state::{InMemoryStore, PostgresStore, SharedStore};

type Error = Box<dyn std::error::Error + Send + Sync>;
type Context<'a> = poise::Context<'a, Data, Error>;

/// Shared application state
pub struct Data {
    pub service: SharedVerificationService,
    pub config: Arc<AppConfig>,
}

async fn event_handler(
    _ctx: &serenity::Context,
    event: &serenity::FullEvent,
    _framework: poise::FrameworkContext<'_, Data, Error>,
    data: &Data,
) -> Result<(), Error> {
    match event {
        serenity::FullEvent::GuildMemberAddition { new_member } => {
            if let Err(e) = handle_member_add(new_member, data).await {
                error!("Failed to handle new member: {}", e);
            }
        }
        serenity::FullEvent::GuildCreate { guild, is_new } => {
            if let Err(e) = handle_guild_create(guild, *is_new, data).await {
                error!("Failed to handle guild create: {}", e);
            }
        }
        _ => {}
    }
    Ok(())
}

async fn build_store(config: &AppConfig) -> Result<SharedStore> {
    match &config.database_url {
        Some(url) => Ok(Arc::new(PostgresStore::connect(url).await?)),
        None => {
            warn!("DATABASE_URL not set: using in-memory storage, state is lost on restart");
            Ok(Arc::new(InMemoryStore::new()))
        }
    }
}

async fn build_broker(config: &AppConfig, mode: Mode) -> Result<SharedBroker> {
    if config.broker.redis_url.is_some() {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "consumer".to_string());
        let consumer = format!("{}-{}", host, uuid::Uuid::new_v4());
        let broker = RedisStreamBroker::connect(&config.broker, consumer).await?;
        return Ok(Arc::new(broker));
    }
    if mode != Mode::All {
        return Err(anyhow::anyhow!(
            "REDIS_URL must be set in {:?} mode: the in-memory queue only works when the bot and webhook receiver share a process",
            mode
        ));
    }
    warn!("REDIS_URL not set: using in-memory queue, pending events are lost on restart");
    Ok(Arc::new(InMemoryBroker::new(config.broker.visibility_timeout)))
}

fn log_bot_id(token: &str) {
    // Discord tokens start with the base64-encoded application ID
    let Some(bot_id_b64) = token.split('.').next() else {
        return;
    };
    use base64::Engine;
    let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
        .decode(bot_id_b64)
        .or_else(|_| base64::engine::general_purpose::URL_SAFE_NO_PAD.decode(bot_id_b64));
    if let Some(id_str) = decoded.ok().and_then(|d| String::from_utf8(d).ok()) {
        info!(
            "Bot ID: {} (configure intents at https://discord.com/developers/applications/{}/bot)",
            id_str, id_str
        );
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    let args = Args::parse();

    let config = Arc::new(AppConfig::from_env()?);
    logging::init(&config.log_level);
    info!("Starting in {:?} mode", args.mode);

    let broker = build_broker(&config, args.mode).await?;

    if args.mode == Mode::Webhook {
        return web::start_webhook_server(config.webhook.clone(), broker).await;
    }

    let store = build_store(&config).await?;
    let token = config.require_discord_token()?.to_string();
    let stripe_key = config.require_stripe_secret_key()?.to_string();
    if args.mode == Mode::All {
        config.require_webhook_secret()?;
    }
    log_bot_id(&token);

    let sync_commands = args.sync_commands;
    let guild_commands = args.guild_commands;
    let target_guild_id = args.guild_id;
    let mode = args.mode;

    if sync_commands {
        info!("--sync-commands: Will force re-register slash commands");
    }
    if guild_commands {
        info!("--guild-commands: Will register commands per-guild (faster for testing)");
    } else {
        info!("Registering commands globally by default (takes up to 1 hour to propagate)");
    }
    if let Some(gid) = target_guild_id {
        info!("--guild-id: Targeting specific guild {}", gid);
    }

    let framework = poise::Framework::builder()
        .options(poise::FrameworkOptions {
            commands: vec![
                ping(),
                help(),
                get_verify_bot(),
                verifyme(),
                reverify(),
                set_role(),
                set_tier(),
                update_tier(),
                subscription_status(),
                verification_logs(),
                get_subscription(),
            ],
            event_handler: |ctx, event, framework, data| {
                Box::pin(event_handler(ctx, event, framework, data))
            },
            pre_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' invoked by {} (ID: {}) in {}",
                        ctx.command().qualified_name,
                        ctx.author().name,
                        ctx.author().id,
                        ctx.guild_id().map(|g| g.to_string()).unwrap_or_else(|| "DM".to_string())
                    );
                    if let Some(guild_id) = ctx.guild_id() {
                        ctx.data()
                            .service
                            .record_command(
                                &guild_id.to_string(),
                                &ctx.author().id.to_string(),
                                &ctx.command().qualified_name,
                            )
                            .await;
                    }
                })
            },
            post_command: |ctx| {
                Box::pin(async move {
                    info!(
                        "Command '{}' completed for {}",
                        ctx.command().qualified_name,
                        ctx.author().name
                    );
                })
            },
            on_error: |error| {
                Box::pin(async move {
                    match error {
                        poise::FrameworkError::Command { error, ctx, .. } => {
                            error!("Error in command '{}': {}", ctx.command().qualified_name, error);
                            let _ = ctx
                                .send(
                                    poise::CreateReply::default()
                                        .content("An unexpected error occurred. Please try again later or contact support.")
                                        .ephemeral(true),
                                )
                                .await;
                        }
                        poise::FrameworkError::ArgumentParse { error, input, ctx, .. } => {
                            error!("Argument parse error in '{}': {} (input: {:?})", ctx.command().qualified_name, error, input);
                        }
                        poise::FrameworkError::MissingBotPermissions { missing_permissions, ctx, .. } => {
                            error!("Bot missing permissions for '{}': {:?}", ctx.command().qualified_name, missing_permissions);
                            let _ = ctx.say(format!("Bot is missing permissions: {:?}", missing_permissions)).await;
                        }
                        poise::FrameworkError::MissingUserPermissions { missing_permissions, ctx, .. } => {
                            error!("User {} missing permissions for '{}': {:?}", ctx.author().name, ctx.command().qualified_name, missing_permissions);
                            let _ = ctx
                                .send(
                                    poise::CreateReply::default()
                                        .content("You do not have permission to use this command.")
                                        .ephemeral(true),
                                )
                                .await;
                        }
                        poise::FrameworkError::GuildOnly { ctx, .. } => {
                            error!("Command '{}' is guild-only, used in DM by {}", ctx.command().qualified_name, ctx.author().name);
                        }
                        other => {
                            error!("Other framework error: {}", other);
                        }
                    }
                })
            },
            ..Default::default()
        })
        .setup(move |ctx, ready, framework| {
            Box::pin(async move {
                info!("Bot logged in as: {}", ready.user.name);

                let locks = Arc::new(KeyedLocks::new());
                let roles: SharedRoleAssigner = Arc::new(DiscordRoleAssigner::new(ctx.http.clone()));
                let identity: SharedIdentityProvider = Arc::new(StripeIdentityClient::new(stripe_key)?);

                let service = Arc::new(VerificationService::new(
                    store.clone(),
                    roles.clone(),
                    identity,
                    locks.clone(),
                    config.core.clone(),
                    config.consumer.role_call_timeout,
                ));

                let consumer = Arc::new(VerificationConsumer::new(
                    broker.clone(),
                    store,
                    roles,
                    locks,
                    config.consumer.clone(),
                    config.broker.max_deliveries,
                ));
                let workers = consumer.spawn();
                info!("Started {} verification consumer tasks", workers.len());

                if mode == Mode::All {
                    let webhook_config = config.webhook.clone();
                    tokio::spawn(async move {
                        if let Err(e) = web::start_webhook_server(webhook_config, broker).await {
                            error!("Webhook server error: {}", e);
                        }
                    });
                }

                // Determine which guilds to register commands for
                let guilds_to_register: Vec<serenity::GuildId> = if let Some(gid) = target_guild_id {
                    vec![serenity::GuildId::new(gid)]
                } else {
                    ready.guilds.iter().map(|g| g.id).collect()
                };

                if guild_commands || sync_commands {
                    for guild_id in &guilds_to_register {
                        info!("Registering commands to guild: {}", guild_id);
                        if let Err(e) = poise::builtins::register_in_guild(
                            ctx,
                            &framework.options().commands,
                            *guild_id,
                        ).await {
                            error!("Failed to register commands for guild {}: {}", guild_id, e);
                        } else {
                            info!("Successfully registered {} commands for guild {}",
                                  framework.options().commands.len(), guild_id);
                        }
                    }
                } else {
                    info!("Registering commands globally...");
                    if let Err(e) = poise::builtins::register_globally(
                        ctx,
                        &framework.options().commands,
                    ).await {
                        error!("Failed to register commands globally: {}", e);
                    } else {
                        info!("Successfully registered {} commands globally (may take up to 1 hour to propagate)",
                              framework.options().commands.len());
                    }
                }

                Ok(Data { service, config })
            })
        })
        .build();

    let intents = serenity::GatewayIntents::non_privileged() | serenity::GatewayIntents::GUILD_MEMBERS;
    let privileged_intents = ["GUILD_MEMBERS"];
    info!("Requesting privileged intents: {:?}", privileged_intents);

    let mut client = serenity::ClientBuilder::new(token, intents)
        .framework(framework)
        .await?;

    info!("Starting bot...");
    if let Err(e) = client.start().await {
        let err_str = e.to_string();
        if err_str.contains("Disallowed") || err_str.contains("intents") {
            error!("Failed to start bot: {}", e);
            error!("The following privileged intents need to be enabled in the Discord Developer Portal:");
            for intent in &privileged_intents {
                error!("  - {}", intent);
            }
            error!("Go to https://discord.com/developers/applications -> Your App -> Bot -> Privileged Gateway Intents");
            return Err(anyhow::anyhow!(
                "Disallowed gateway intents. Enable these in Discord Developer Portal: {:?}",
                privileged_intents
            ));
        }
        return Err(e.into());
    }
    warn!("Bot ended.");

    Ok(())
}
