//! Outpost CLI: expose local services through a reverse tunnel.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use outpost_auth::{AuthError, AuthRepo, AuthStore, MemoryStore, RepoConfig, Token, TokenKind};
use outpost_client::{ClientConfig, TunnelClient};
use outpost_core::{ConnManager, Service};
use outpost_edge::{HttpEdge, HttpEdgeConfig, TcpEdge, TcpEdgeConfig};

/// Expose local services through a reverse tunnel.
#[derive(Parser, Debug)]
#[command(name = "outpost", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log filter (trace, debug, info, warn, error).
    #[arg(long, global = true, default_value = "info", env = "OUTPOST_LOG")]
    log_level: String,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the public tunnel server
    Serve(ServeArgs),
    /// Connect a local service to a tunnel server
    Connect(ConnectArgs),
    /// Token utilities
    Token {
        #[command(subcommand)]
        command: TokenCommands,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// Reverse-dial listen address clients connect to.
    #[arg(long, default_value = "0.0.0.0:4471")]
    rev_listen: String,

    /// Public HTTP edge listen address.
    #[arg(long, default_value = "0.0.0.0:8080")]
    http_listen: String,

    /// Public domain; tunnels live on `<keyID>.<domain>`.
    #[arg(long)]
    domain: String,

    /// Bind host for dynamically allocated TCP endpoints.
    #[arg(long, default_value = "0.0.0.0")]
    tcp_bind_host: String,

    /// Host advertised in allocated TCP endpoints. Defaults to the domain.
    #[arg(long)]
    tcp_public_host: Option<String>,

    /// Port range for TCP tunnels, inclusive.
    #[arg(long, default_value_t = 10000)]
    tcp_port_min: u16,
    #[arg(long, default_value_t = 11000)]
    tcp_port_max: u16,

    /// TLS certificate and key for the reverse-dial listener (PEM). Both or
    /// neither.
    #[arg(long, requires = "tls_key")]
    tls_cert: Option<PathBuf>,
    #[arg(long, requires = "tls_cert")]
    tls_key: Option<PathBuf>,

    /// Prefix for auth store keys.
    #[arg(long, default_value = "")]
    key_prefix: String,

    /// Salt for secret hashing.
    #[arg(long, default_value = "", env = "OUTPOST_SALT")]
    salt: String,

    /// Accepted tunnel tokens in wire form; repeatable. Generate them with
    /// `outpost token generate`.
    #[arg(long = "token")]
    tokens: Vec<String>,
}

#[derive(Args, Debug)]
struct ConnectArgs {
    /// Tunnel token in wire form.
    #[arg(short, long, env = "OUTPOST_TOKEN")]
    token: String,

    /// Tunnel server reverse-dial address, `host:port`.
    #[arg(short, long, env = "OUTPOST_SERVER")]
    server: String,

    /// Local service to expose, `host:port`.
    #[arg(short, long)]
    expose: String,

    /// Connect without TLS.
    #[arg(long)]
    no_tls: bool,

    /// Skip certificate verification. Testing only.
    #[arg(long)]
    insecure: bool,

    /// Fall back to the V1 protocol (one connection per request).
    #[arg(long)]
    disable_v2: bool,
}

#[derive(Subcommand, Debug)]
enum TokenCommands {
    /// Mint a token and print its wire form
    Generate {
        /// Base key ID; random when omitted.
        #[arg(long, default_value = "")]
        key_id: String,

        /// Token kind: web or tcp.
        #[arg(long, default_value = "web")]
        kind: String,

        /// Store TTL in hours applied when the server loads the token.
        #[arg(long, default_value_t = 24)]
        ttl_hours: u64,
    },
    /// Remove a token from the auth store
    Delete {
        /// Base key ID of the token to remove.
        #[arg(long)]
        key_id: String,

        /// Prefix for auth store keys, matching the server's.
        #[arg(long, default_value = "")]
        key_prefix: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&cli.log_level)
                .with_context(|| format!("invalid log level {:?}", cli.log_level))?,
        )
        .init();

    match cli.command {
        Commands::Serve(args) => serve(args).await,
        Commands::Connect(args) => connect(args).await,
        Commands::Token { command } => token_command(command).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let repo = Arc::new(AuthRepo::new(
        MemoryStore::new(),
        RepoConfig {
            key_prefix: args.key_prefix.clone(),
            salt: args.salt.clone(),
        },
    ));

    if args.tokens.is_empty() {
        bail!("no tokens configured: pass at least one --token (see `outpost token generate`)");
    }

    for encoded in &args.tokens {
        let token = Token::decode(encoded).context("invalid --token value")?;
        info!(key_id = %token.id, kind = token.kind.as_str(), "token loaded");
        repo.save_token(&token)
            .await
            .context("failed to load token")?;
    }

    let tcp_edge = TcpEdge::new(TcpEdgeConfig {
        bind_host: args.tcp_bind_host.clone(),
        public_host: args
            .tcp_public_host
            .clone()
            .unwrap_or_else(|| args.domain.clone()),
        port_min: args.tcp_port_min,
        port_max: args.tcp_port_max,
    });

    let domain = args.domain.clone();
    let service = Arc::new(
        Service::new(
            Arc::new(ConnManager::new()),
            Arc::new(ConnManager::new()),
            repo,
        )
        .with_endpoint_generator(move |key_id| Ok(format!("https://{key_id}.{domain}")))
        .with_tcp_endpoint_allocator(tcp_edge.clone()),
    );
    tcp_edge.attach(service.clone());

    let tls = match (&args.tls_cert, &args.tls_key) {
        (Some(cert), Some(key)) => Some(load_tls_acceptor(cert, key)?),
        _ => None,
    };

    let ctx = CancellationToken::new();

    let http_edge = HttpEdge::bind(
        HttpEdgeConfig {
            listen: args.http_listen.clone(),
            domain: args.domain.clone(),
        },
        service.clone(),
    )
    .await
    .context("failed to bind HTTP edge")?;

    let rev_listener = TcpListener::bind(&args.rev_listen)
        .await
        .with_context(|| format!("failed to bind reverse-dial listener on {}", args.rev_listen))?;

    info!(
        rev = %args.rev_listen,
        http = %args.http_listen,
        domain = %args.domain,
        tls = tls.is_some(),
        "server started"
    );

    let http_task = tokio::spawn(http_edge.run(ctx.clone()));
    let rev_task = tokio::spawn(run_reverse_listener(
        rev_listener,
        service,
        tls,
        ctx.clone(),
    ));

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down");
    ctx.cancel();
    tcp_edge.shutdown();

    // Give in-flight handlers a moment to notice the cancellation.
    let _ = tokio::time::timeout(Duration::from_secs(5), async {
        let _ = http_task.await;
        let _ = rev_task.await;
    })
    .await;

    Ok(())
}

async fn run_reverse_listener(
    listener: TcpListener,
    service: Arc<Service>,
    tls: Option<TlsAcceptor>,
    ctx: CancellationToken,
) {
    loop {
        let (socket, peer) = tokio::select! {
            res = listener.accept() => match res {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "failed to accept reverse connection");
                    continue;
                }
            },
            _ = ctx.cancelled() => return,
        };

        debug!(peer = %peer, "reverse connection accepted");

        let service = service.clone();
        let tls = tls.clone();
        let ctx = ctx.child_token();
        tokio::spawn(async move {
            let result = match tls {
                Some(acceptor) => match acceptor.accept(socket).await {
                    Ok(stream) => service.handle_reverse_conn(&ctx, stream).await,
                    Err(e) => {
                        debug!(peer = %peer, error = %e, "TLS accept failed");
                        return;
                    }
                },
                None => service.handle_reverse_conn(&ctx, socket).await,
            };

            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "reverse connection ended with error");
            }
        });
    }
}

async fn connect(args: ConnectArgs) -> Result<()> {
    let token = Token::decode(&args.token).context(
        "invalid token: get one from your administrator or generate one with \
         `outpost token generate`",
    )?;

    let cfg = ClientConfig {
        server_addr: args.server.clone(),
        dest_addr: args.expose.clone(),
        no_tls: args.no_tls,
        insecure: args.insecure,
        enable_v2: !args.disable_v2,
    };

    let ctx = CancellationToken::new();
    let signal_ctx = ctx.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        signal_ctx.cancel();
    });

    info!(server = %args.server, expose = %args.expose, "client started");

    TunnelClient::new(cfg, token)
        .run(ctx)
        .await
        .context("tunnel client failed")?;

    Ok(())
}

async fn token_command(command: TokenCommands) -> Result<()> {
    match command {
        TokenCommands::Generate { key_id, kind, ttl_hours } => {
            let kind = match kind.as_str() {
                "web" => TokenKind::Web,
                "tcp" => TokenKind::Tcp,
                other => bail!("unknown token kind {other:?}: expected web or tcp"),
            };

            let token = Token::generate(&key_id, kind, Duration::from_secs(ttl_hours * 3600));

            println!("key ID: {}", token.id);
            println!("kind:   {}", token.kind.as_str());
            println!("token:  {}", token.encode());

            Ok(())
        }
        TokenCommands::Delete { key_id, key_prefix } => {
            let repo = AuthRepo::new(
                MemoryStore::new(),
                RepoConfig { key_prefix, salt: String::new() },
            );

            match repo.delete_token(&key_id).await {
                Ok(()) => {
                    println!("token {key_id} deleted");
                    Ok(())
                }
                Err(AuthError::TokenNotFound) => {
                    bail!("no token with key ID {key_id:?} in the store")
                }
                Err(e) => Err(e).context("failed to delete token"),
            }
        }
    }
}

fn load_tls_acceptor(cert: &PathBuf, key: &PathBuf) -> Result<TlsAcceptor> {
    let certs = rustls_pemfile::certs(&mut std::io::BufReader::new(
        std::fs::File::open(cert).with_context(|| format!("failed to open {}", cert.display()))?,
    ))
    .collect::<Result<Vec<_>, _>>()
    .context("failed to parse TLS certificate")?;

    let key = rustls_pemfile::private_key(&mut std::io::BufReader::new(
        std::fs::File::open(key).with_context(|| format!("failed to open {}", key.display()))?,
    ))
    .context("failed to parse TLS key")?
    .context("no private key found")?;

    let config = rustls::ServerConfig::builder_with_protocol_versions(&[&rustls::version::TLS13])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;

    Ok(TlsAcceptor::from(Arc::new(config)))
}
