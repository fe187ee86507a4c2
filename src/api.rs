//! REST API server
//!
//! HTTP endpoints over the public engine interfaces: chain status, the
//! current block, account management, airdrops and transfers. Handlers never
//! touch chain state directly.

use crate::account::{Account, Accounts};
use crate::chain::{Block, Chain};
use crate::error::{ChainError, Result};
use crate::transaction::{Transaction, Transactions};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// Airdrop bounds: must be positive and at most this many coins per call.
const MAX_AIRDROP_AMOUNT: f64 = 10_000.0;

#[derive(Clone)]
pub struct ApiState {
    pub chain: Arc<Chain>,
    pub accounts: Arc<Accounts>,
    pub transactions: Arc<Transactions>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub height: u64,
    pub current_hash: Option<String>,
    pub difficulty: Option<u64>,
    pub accounts: i64,
    pub transactions: i64,
}

/// Account rendering without key material.
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub label: String,
    pub address: String,
    pub balance: f64,
    pub create_time: u64,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        AccountView {
            label: account.label(),
            address: account.address.to_hex(),
            balance: account.balance,
            create_time: account.create_time,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct TransactionView {
    pub id: String,
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: f64,
    pub create_time: u64,
}

impl From<&Transaction> for TransactionView {
    fn from(tx: &Transaction) -> Self {
        TransactionView {
            id: tx.id.to_hex(),
            hash: tx.hash.to_hex(),
            from: tx.from.to_hex(),
            to: tx.to.to_hex(),
            amount: tx.amount,
            create_time: tx.create_time,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub label: String,
}

#[derive(Debug, Deserialize)]
pub struct AirdropRequest {
    pub to: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub from: String,
    pub to: String,
    pub amount: f64,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(ChainError);

impl From<ChainError> for ApiError {
    fn from(err: ChainError) -> Self {
        ApiError(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            ChainError::AccountNotFound | ChainError::NotFound => StatusCode::NOT_FOUND,
            ChainError::InsufficientFunds
            | ChainError::InvalidInput(_)
            | ChainError::NoTransactions => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorBody {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/block/current", get(get_current_block))
        .route("/accounts", get(list_accounts).post(create_account))
        .route("/airdrop", post(airdrop))
        .route("/transactions", post(submit_transaction))
        .with_state(state)
}

/// Binds and serves the API until the process ends.
pub async fn run_api_server(state: ApiState, port: u16) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| ChainError::Network(format!("cannot listen on port {}: {}", port, e)))?;
    info!("API server listening on 0.0.0.0:{}", port);
    axum::serve(listener, router(state))
        .await
        .map_err(|e| ChainError::Network(e.to_string()))
}

async fn get_status(
    State(state): State<ApiState>,
) -> std::result::Result<Json<StatusResponse>, ApiError> {
    let current = state.chain.current_block()?;
    Ok(Json(StatusResponse {
        height: state.chain.block_count()?,
        current_hash: current.as_ref().map(|b| b.hash.to_hex()),
        difficulty: current.as_ref().map(|b| b.difficulty),
        accounts: state.accounts.count(),
        transactions: state.transactions.count(),
    }))
}

async fn get_current_block(
    State(state): State<ApiState>,
) -> std::result::Result<Json<Block>, Response> {
    match state.chain.current_block() {
        Ok(Some(block)) => Ok(Json(block)),
        Ok(None) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ErrorBody {
                error: "Chain is unavailable while the genesis block is being created".to_string(),
            }),
        )
            .into_response()),
        Err(e) => Err(ApiError(e).into_response()),
    }
}

async fn list_accounts(
    State(state): State<ApiState>,
) -> std::result::Result<Json<Vec<AccountView>>, ApiError> {
    let accounts = state.accounts.list()?;
    Ok(Json(accounts.iter().map(AccountView::from).collect()))
}

async fn create_account(
    State(state): State<ApiState>,
    Json(request): Json<CreateAccountRequest>,
) -> std::result::Result<(StatusCode, Json<AccountView>), ApiError> {
    let account = state.accounts.create(&request.label)?;
    Ok((StatusCode::CREATED, Json(AccountView::from(&account))))
}

async fn airdrop(
    State(state): State<ApiState>,
    Json(request): Json<AirdropRequest>,
) -> std::result::Result<Json<AccountView>, ApiError> {
    if request.amount <= 0.0 || request.amount > MAX_AIRDROP_AMOUNT {
        return Err(ApiError(ChainError::InvalidInput(format!(
            "Invalid amount: {}. Range allowed is greater than 0 up to {}",
            request.amount, MAX_AIRDROP_AMOUNT
        ))));
    }
    let account = state.accounts.airdrop(&request.to, request.amount)?;
    Ok(Json(AccountView::from(&account)))
}

async fn submit_transaction(
    State(state): State<ApiState>,
    Json(request): Json<TransferRequest>,
) -> std::result::Result<(StatusCode, Json<TransactionView>), ApiError> {
    if request.amount <= 0.0 {
        return Err(ApiError(ChainError::InvalidInput(format!(
            "Invalid amount: {}",
            request.amount
        ))));
    }
    let transaction =
        state
            .transactions
            .create(&state.accounts, &request.from, &request.to, request.amount)?;
    Ok((StatusCode::CREATED, Json(TransactionView::from(&transaction))))
}
