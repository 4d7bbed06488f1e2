//! scpctl - relay client for SCP-protected communities
//!
//! Generates keys, fetches events, retrieves community post keys and
//! publishes protected posts.

use anyhow::Context;
use clap::{Parser, Subcommand};
use scp_client::access::{open_content, PostKeysWindow};
use scp_client::reader::CommunityFeedQuery;
use scp_client::writer::seal_community_post;
use scp_client::{
    reader_for, AccessResolver, Config, Ed25519Signer, GroupDescriptor, LocalEventSigner, Publisher, Session,
};
use scp_core::{FetchRequest, Filter, SecretKey};
use scp_net::FetchFacade;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "scpctl")]
#[command(about = "Relay client for SCP-protected communities and channels")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate an account key
    Keygen {
        /// Write the secret key here instead of printing it
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Fetch events from the read relay, one JSON event per line
    Fetch {
        #[arg(long, value_delimiter = ',')]
        kinds: Vec<u32>,
        #[arg(long, value_delimiter = ',')]
        authors: Vec<String>,
        #[arg(long, value_delimiter = ',')]
        ids: Vec<String>,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        until: Option<u64>,
        #[arg(long, default_value = "20")]
        limit: usize,
        /// Run a relay-side cached query of this type instead of a filter
        #[arg(long)]
        cached: Option<String>,
        /// JSON parameters for --cached
        #[arg(long, default_value = "{}")]
        params: String,
    },

    /// Recover content keys for a community's posts and decrypt them
    PostKeys {
        /// Community creator public key (hex)
        #[arg(long)]
        creator: String,
        #[arg(long)]
        community: String,
        #[arg(long)]
        since: Option<u64>,
        #[arg(long)]
        until: Option<u64>,
        #[arg(long, default_value = "50")]
        limit: usize,
        /// Message signed for the gatekeeper
        #[arg(long, default_value = "scp key request")]
        message: String,
    },

    /// Seal and publish a protected community post
    Post {
        #[arg(long)]
        creator: String,
        #[arg(long)]
        community: String,
        /// Post text
        #[arg(long)]
        text: String,
    },
}

fn init_logging(config: &Config) {
    let default_level = if config.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "scpctl={default_level},scp_client={default_level},scp_net={default_level}"
        ))
    });
    if config.log_format == "json" {
        tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init();
    }
}

fn connect(config: &Config) -> anyhow::Result<Arc<FetchFacade>> {
    let facade = FetchFacade::connect(config.read_relay()?, &config.write_relays, config.net_config())
        .context("setting up relay transports")?;
    Ok(Arc::new(facade))
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = cli.config;
    match cli.command {
        Command::Keygen { out } => {
            let secret = SecretKey::generate();
            let session = Session::new(secret.clone());
            match out {
                Some(path) => {
                    std::fs::write(&path, format!("{}\n", secret.to_hex()))
                        .with_context(|| format!("writing {}", path.display()))?;
                    info!(path = %path.display(), "secret key written");
                    println!("{}", json!({ "pubkey": session.pubkey_hex() }));
                }
                None => println!("{}", json!({ "pubkey": session.pubkey_hex(), "secret": secret.to_hex() })),
            }
        }

        Command::Fetch {
            kinds,
            authors,
            ids,
            since,
            until,
            limit,
            cached,
            params,
        } => {
            let facade = connect(&config)?;
            let request = match cached {
                Some(event_type) => FetchRequest::Cached {
                    event_type,
                    params: serde_json::from_str::<Value>(&params).context("--params must be JSON")?,
                },
                None => {
                    let mut filter = Filter::new().limit(limit);
                    if !kinds.is_empty() {
                        filter = filter.kinds(kinds);
                    }
                    if !authors.is_empty() {
                        filter = filter.authors(authors);
                    }
                    if !ids.is_empty() {
                        filter = filter.ids(ids);
                    }
                    if let Some(since) = since {
                        filter = filter.since(since);
                    }
                    if let Some(until) = until {
                        filter = filter.until(until);
                    }
                    FetchRequest::Filter(filter)
                }
            };
            let events = facade.fetch_events(vec![request]).await?;
            for event in &events {
                println!("{}", serde_json::to_string(event)?);
            }
            info!(count = events.len(), "fetched");
        }

        Command::PostKeys {
            creator,
            community,
            since,
            until,
            limit,
            message,
        } => {
            let session = Session::new(config.require_secret()?);
            let facade = connect(&config)?;
            let reader = reader_for(config.reader_version, Arc::clone(&facade), Some(session.clone()));
            let info = reader
                .fetch_community_info(&creator, &community)
                .await?
                .with_context(|| format!("community {creator}:{community} not found"))?;

            let posts = reader
                .fetch_community_feed(&CommunityFeedQuery {
                    community_uri: info.community_uri.clone(),
                    since,
                    until,
                    limit: Some(limit),
                })
                .await?;
            let resolver = AccessResolver::new(facade, config.gatekeeper_url.clone());
            let mut keys = resolver
                .retrieve_post_keys_by_events(&session, &posts, std::slice::from_ref(&info), &message)
                .await;
            if keys.is_empty() && !posts.is_empty() {
                keys = resolver
                    .retrieve_community_post_keys(&session, &info, PostKeysWindow { since, until }, &message)
                    .await;
            }

            for post in &posts {
                let Some(key) = keys.get(&post.id) else {
                    println!("{}", json!({ "id": post.id, "locked": true }));
                    continue;
                };
                let opened = SecretKey::from_hex(key)
                    .map_err(scp_client::AccessError::from)
                    .and_then(|key| open_content(post, &key));
                match opened {
                    Ok(body) => println!("{}", json!({ "id": post.id, "author": post.pubkey, "message": body.message })),
                    Err(err) => println!("{}", json!({ "id": post.id, "error": err.to_string() })),
                }
            }
            info!(posts = posts.len(), keys = keys.len(), "post keys retrieved");
        }

        Command::Post {
            creator,
            community,
            text,
        } => {
            let secret = config.require_secret()?;
            let session = Session::new(secret.clone());
            let facade = connect(&config)?;
            let reader = reader_for(config.reader_version, Arc::clone(&facade), Some(session.clone()));
            let info = reader
                .fetch_community_info(&creator, &community)
                .await?
                .with_context(|| format!("community {creator}:{community} not found"))?;

            let unsigned = seal_community_post(&session, &info, &text)?;
            let signer = Arc::new(LocalEventSigner::new(Ed25519Signer::from_secret(&secret)));
            let published = Publisher::new(facade, signer).publish(unsigned).await?;

            // self-check: the author must be able to reopen the post
            let recovered = scp_client::access::recover_self_authored(
                &session,
                &published.event,
                GroupDescriptor::Community(&info),
            );
            anyhow::ensure!(recovered.is_recovered(), "published post does not reopen with its own key");

            println!(
                "{}",
                json!({ "id": published.event.id, "accepted": published.accepted(), "relays": published.responses.len() })
            );
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(&cli.config);

    if let Err(e) = cli.config.validate() {
        error!("Invalid configuration: {:#}", e);
        return ExitCode::FAILURE;
    }

    info!("scpctl v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
