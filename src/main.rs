mod api;
mod auth;
mod config;
mod mission;
mod openai;
mod prompts;
mod registry;
mod relay;
mod session;
mod transcript;
mod twilio;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use auth::Passphrase;
use config::Config;
use prompts::Prompts;
use registry::SessionRegistry;
use relay::RelayClient;
use transcript::TranscriptStore;
use twilio::outbound::TwilioClient;

const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state accessible from all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub prompts: Arc<Prompts>,
    pub passphrase: Passphrase,
    pub registry: SessionRegistry,
    pub relay: Arc<RelayClient>,
    pub twilio: Arc<TwilioClient>,
    pub transcripts: TranscriptStore,
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    match args.get(1).map(|s| s.as_str()) {
        Some("--version") => println!("voiceline {VERSION}"),
        Some("--help") | Some("-h") => print_usage(),
        Some(other) => {
            eprintln!("Unknown option: {other}");
            print_usage();
            std::process::exit(1);
        }
        None => {
            let rt = tokio::runtime::Runtime::new().expect("Failed to create tokio runtime");
            rt.block_on(server());
        }
    }
}

fn print_usage() {
    println!("voiceline {VERSION}");
    println!("Phone bridge between Twilio and the OpenAI Realtime API");
    println!();
    println!("Usage: voiceline [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --version   Print version");
    println!("  --help, -h  Print this help message");
    println!();
    println!("Without options, starts the voice server.");
}

async fn server() {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "voiceline=info,tower_http=info".into()),
        )
        .init();

    // Config errors are fatal: never accept calls half-configured.
    let config = match Config::load() {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let prompts = match Prompts::load(&config.prompts) {
        Ok(p) => Arc::new(p),
        Err(e) => {
            eprintln!("Failed to load prompts: {e}");
            std::process::exit(1);
        }
    };

    // Validated non-empty by Config::load already.
    let passphrase = match Passphrase::new(&config.auth.passphrase) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("Invalid passphrase: {e}");
            std::process::exit(1);
        }
    };

    tracing::info!(
        host = %config.server.host,
        port = config.server.port,
        from = %config.twilio.phone_number,
        "Starting voiceline"
    );

    let state = AppState {
        prompts,
        passphrase,
        registry: SessionRegistry::new(config.mission.retention_hours),
        relay: Arc::new(RelayClient::new(&config.relay)),
        twilio: Arc::new(TwilioClient::new(
            &config.twilio,
            &config.server.external_url,
        )),
        transcripts: TranscriptStore::new(&config.transcripts.dir),
        config: config.clone(),
    };

    let app = Router::new()
        // Health
        .route("/", get(api::calls::root))
        // Twilio webhooks
        .route("/incoming-call", post(twilio::webhook::handle_incoming_call))
        .route(
            "/twiml",
            get(twilio::webhook::handle_twiml).post(twilio::webhook::handle_twiml),
        )
        .route("/call-status", post(api::calls::handle_call_status))
        // Twilio media stream (WebSocket)
        .route("/media-stream", get(twilio::media::handle_media_upgrade))
        // Mission API
        .route("/call/number/{phone_number}", post(api::calls::handle_call_number))
        .route("/call/{call_sid}/result", get(api::calls::handle_call_result))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .expect("Invalid server address");

    tracing::info!(%addr, "Listening");

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind");

    axum::serve(listener, app).await.expect("Server error");
}
