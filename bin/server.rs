// Microloan Ledger - Reporting Server
// Read-only JSON API over the ledger: balances, statuses, statements

use anyhow::Context;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

use microloan_ledger::{LedgerConfig, LedgerError, LedgerService, Loan, LoanStatus};

#[derive(Parser)]
#[command(name = "ledger-server")]
#[command(about = "Read-only reporting API for the microloan ledger")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LEDGER_CONFIG", default_value = "microloan.toml")]
    config: PathBuf,

    /// Database file (overrides config file)
    #[arg(long, env = "LEDGER_DB")]
    db: Option<PathBuf>,

    /// Listen address (overrides config file)
    #[arg(long)]
    bind: Option<String>,
}

/// Shared application state
#[derive(Clone)]
struct AppState {
    ledger: Arc<LedgerService>,
}

/// API Response wrapper
#[derive(Serialize)]
struct ApiResponse<T> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }
}

impl ApiResponse<()> {
    fn err(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
        }
    }
}

fn respond<T: Serialize>(result: microloan_ledger::Result<T>) -> Response {
    match result {
        Ok(data) => (StatusCode::OK, Json(ApiResponse::ok(data))).into_response(),
        Err(e) => {
            let status = match &e {
                LedgerError::NotFound { .. } => StatusCode::NOT_FOUND,
                LedgerError::Validation(_) => StatusCode::BAD_REQUEST,
                LedgerError::InconsistentLedger(_) | LedgerError::DuplicatePosting(_) => {
                    StatusCode::CONFLICT
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            tracing::warn!(error = %e, status = status.as_u16(), "request failed");
            (status, Json(ApiResponse::err(e.to_string()))).into_response()
        }
    }
}

/// Loan row (simplified for API)
#[derive(Serialize)]
struct LoanResponse {
    id: i64,
    loan_no: i64,
    book_no: i64,
    week: i64,
    status: &'static str,
    amount: f64,
    balance: f64,
    adjusted: bool,
}

impl From<Loan> for LoanResponse {
    fn from(loan: Loan) -> Self {
        Self {
            id: loan.id,
            loan_no: loan.loan_no,
            book_no: loan.book_no,
            week: loan.week,
            status: loan.status.as_str(),
            amount: loan.amount,
            balance: loan.balance_amount,
            adjusted: loan.adjustment_status,
        }
    }
}

#[derive(Serialize)]
struct StatusResponse {
    loan_id: i64,
    status: LoanStatus,
}

#[derive(Deserialize)]
struct WeekQuery {
    week: Option<i64>,
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /api/health - Health check
async fn health_check() -> impl IntoResponse {
    Json(ApiResponse::ok("OK"))
}

/// GET /api/loans - Every loan with its stored balance
async fn get_loans(State(state): State<AppState>) -> Response {
    respond(
        state
            .ledger
            .list_loans()
            .map(|loans| loans.into_iter().map(LoanResponse::from).collect::<Vec<_>>()),
    )
}

/// GET /api/loans/:id/balance?week=N - Balance computed from the ledgers
async fn get_balance(
    State(state): State<AppState>,
    Path(loan_id): Path<i64>,
    Query(query): Query<WeekQuery>,
) -> Response {
    let result = query
        .week
        .map(Ok)
        .unwrap_or_else(|| state.ledger.current_week())
        .and_then(|week| state.ledger.get_loan_balance(loan_id, week));
    respond(result)
}

/// GET /api/loans/:id/status
async fn get_status(State(state): State<AppState>, Path(loan_id): Path<i64>) -> Response {
    respond(
        state
            .ledger
            .get_loan_status(loan_id)
            .map(|status| StatusResponse { loan_id, status }),
    )
}

/// GET /api/loans/:id/statement?week=N
async fn get_statement(
    State(state): State<AppState>,
    Path(loan_id): Path<i64>,
    Query(query): Query<WeekQuery>,
) -> Response {
    respond(state.ledger.loan_statement(loan_id, query.week))
}

/// GET /api/weeks - Registered weeks
async fn get_weeks(State(state): State<AppState>) -> Response {
    respond(state.ledger.list_weeks())
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(db) = cli.db {
        config.database.path = db;
    }
    if let Some(bind) = cli.bind {
        config.server.bind = bind;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .init();

    println!("🌐 Microloan Ledger - Reporting Server");
    println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");

    if !config.database.path.exists() {
        eprintln!("❌ Database not found at {}", config.database.path.display());
        eprintln!("   Run: microloan-ledger init");
        std::process::exit(1);
    }

    let ledger = LedgerService::open(&config)
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;
    println!("✓ Database opened: {}", config.database.path.display());

    // Create shared state
    let state = AppState {
        ledger: Arc::new(ledger),
    };

    // Build API routes
    let api_routes = Router::new()
        .route("/health", get(health_check))
        .route("/loans", get(get_loans))
        .route("/loans/:id/balance", get(get_balance))
        .route("/loans/:id/status", get(get_status))
        .route("/loans/:id/statement", get(get_statement))
        .route("/weeks", get(get_weeks))
        .with_state(state);

    let app = Router::new()
        .nest("/api", api_routes)
        .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.server.bind.as_str())
        .await
        .with_context(|| format!("failed to bind {}", config.server.bind))?;

    println!("\n🚀 Server running on http://{}", config.server.bind);
    println!("   API: http://{}/api/loans", config.server.bind);
    println!("\n   Press Ctrl+C to stop\n");

    axum::serve(listener, app).await.context("server stopped")?;
    Ok(())
}
