use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use log::info;
use metrics::counter;
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::asset::{Asset, AssetType};
use crate::block::{Block, BlockHeader};
use crate::contract::{CallOutcome, Contract};
use crate::ledger::LedgerStats;
use crate::message::ConversationEntry;
use crate::node::{Node, PeersOverview};
use crate::sync::{AdoptReport, ChainBundle, MessageAnnounce, SyncReport, TransactionAnnounce};
use crate::transaction::Transaction;
use crate::wallet::{User, Wallet};
use crate::{utils, NodeError, Result};

/// API-facing errors with their HTTP status
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    Node(#[from] NodeError),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::InvalidRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Node(err) => {
                let status = match err {
                    NodeError::NotFound(_) => StatusCode::NOT_FOUND,
                    NodeError::Unauthorized(_) => StatusCode::FORBIDDEN,
                    NodeError::PeerUnreachable(_) => StatusCode::BAD_GATEWAY,
                    NodeError::StoreConflict(_) => StatusCode::CONFLICT,
                    NodeError::Storage(_) | NodeError::Serialization(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    _ => StatusCode::BAD_REQUEST,
                };
                (status, err.to_string())
            }
        };

        let body = Json(serde_json::json!({
            "error": message,
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

/// Envelope for operator responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: String,
}

impl<T> ApiResponse<T> {
    fn ok(data: T, message: &str) -> Json<Self> {
        Json(ApiResponse {
            success: true,
            data: Some(data),
            message: message.to_string(),
        })
    }
}

// --- request bodies ---

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct TransferRequest {
    pub sender: String,
    pub recipient: String,
    pub amount: f64,
}

#[derive(Debug, Deserialize)]
pub struct MineRequest {
    pub miner: String,
}

#[derive(Debug, Deserialize)]
pub struct RegisterAssetRequest {
    pub owner: String,
    #[serde(rename = "type")]
    pub asset_type: String,
    pub name: String,
    /// Plain text for domains, base64 for media
    pub content: String,
}

#[derive(Debug, Deserialize)]
pub struct UpdateAssetRequest {
    pub owner: String,
    pub content: String,
    /// Set when `content` is base64-encoded binary
    #[serde(default)]
    pub content_base64: bool,
}

#[derive(Debug, Deserialize)]
pub struct OwnerRequest {
    pub owner: String,
}

#[derive(Debug, Deserialize)]
pub struct DeployContractRequest {
    pub owner: String,
    pub code: String,
}

#[derive(Debug, Deserialize)]
pub struct CallContractRequest {
    pub caller: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub sender: String,
    pub recipient: String,
    pub content: String,
    #[serde(default)]
    pub asset_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct InviteRequest {
    pub sender: String,
    pub recipient: String,
}

#[derive(Debug, Deserialize)]
pub struct PeerUpdateRequest {
    pub ip_address: String,
}

#[derive(Debug, Deserialize)]
pub struct SearchParams {
    #[serde(default)]
    pub q: String,
}

#[derive(Debug, Deserialize)]
pub struct ViewerParams {
    #[serde(default)]
    pub viewer: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WalletResponse {
    pub username: String,
    pub wallet_id: String,
    pub balance: f64,
    pub last_mined: f64,
}

impl WalletResponse {
    fn from_parts(user: User, wallet: Wallet) -> Self {
        WalletResponse {
            username: user.username,
            wallet_id: wallet.wallet_id,
            balance: wallet.balance,
            last_mined: wallet.last_mined,
        }
    }
}

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub node: Arc<Node>,
}

/// Build the full router: peer API plus operator surface
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // peer API
        .route("/api/chain_meta", get(chain_meta))
        .route("/api/block/:hash", get(block_by_hash))
        .route("/api/assets_meta", get(assets_meta))
        .route("/api/asset_data/:id", get(asset_data))
        .route("/api/send_transaction", post(receive_transaction))
        .route("/api/messenger/receive_message", post(receive_message))
        .route("/api/get_fees", get(get_fees))
        .route("/peer_update", post(peer_update))
        .route("/chain", get(full_chain))
        // operator surface
        .route("/register", post(register))
        .route("/login", post(login))
        .route("/wallet/:username", get(wallet_info))
        .route("/transfer", post(transfer))
        .route("/mine", post(mine))
        .route("/stats", get(stats))
        .route("/assets", post(register_asset))
        .route(
            "/assets/:id",
            get(view_asset).put(update_asset).delete(delete_asset),
        )
        .route("/assets/owner/:wallet", get(assets_of))
        .route("/search", get(search))
        .route("/contracts", post(deploy_contract))
        .route("/contracts/:address", get(get_contract))
        .route("/contracts/:address/call", post(call_contract))
        .route("/messages", post(send_message))
        .route("/messages/invite", post(send_invite))
        .route("/messages/:user/:other", get(conversation))
        .route("/transactions/:wallet", get(transactions_for))
        .route("/peers", get(peers_overview))
        .route("/sync", post(sync_now))
        .route("/sync/adopt", post(adopt_chain))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API until the process exits
pub async fn start_server(state: AppState, port: u16) -> Result<()> {
    let app = create_router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    info!("HTTP API listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}

// --- peer API handlers ---

/// All block headers, ordered by index ascending
async fn chain_meta(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<BlockHeader>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "chain_meta");
    Ok(Json(state.node.ledger.headers()?))
}

async fn block_by_hash(
    State(state): State<AppState>,
    Path(hash): Path<String>,
) -> std::result::Result<Json<Block>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "block");
    Ok(Json(state.node.ledger.block_by_hash(&hash)?))
}

async fn assets_meta(
    State(state): State<AppState>,
) -> std::result::Result<Json<Vec<serde_json::Value>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "assets_meta");
    let metas = state
        .node
        .assets
        .asset_ids()?
        .into_iter()
        .map(|asset_id| serde_json::json!({ "asset_id": asset_id }))
        .collect();
    Ok(Json(metas))
}

/// Full asset record, content base64-encoded by the serde codec
async fn asset_data(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> std::result::Result<Json<Asset>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "asset_data");
    Ok(Json(state.node.assets.get(&id)?))
}

/// Idempotent mempool insert
async fn receive_transaction(
    State(state): State<AppState>,
    Json(announce): Json<TransactionAnnounce>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "send_transaction");
    state
        .node
        .ledger
        .receive_transaction(announce.into_transaction())?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Idempotent message insert
async fn receive_message(
    State(state): State<AppState>,
    Json(announce): Json<MessageAnnounce>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "receive_message");
    state.node.messages.receive(announce.into_message())?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

async fn get_fees(
    State(state): State<AppState>,
) -> std::result::Result<Json<BTreeMap<String, f64>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "get_fees");
    Ok(Json(state.node.store.fees()?))
}

/// Refresh the announcing peer's last-seen stamp
async fn peer_update(
    State(state): State<AppState>,
    Json(request): Json<PeerUpdateRequest>,
) -> std::result::Result<Json<serde_json::Value>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "peer_update");
    if request.ip_address.is_empty() {
        return Err(ApiError::InvalidRequest("ip_address is required".to_string()));
    }
    state.node.peers.touch(&request.ip_address)?;
    Ok(Json(serde_json::json!({ "status": "ok" })))
}

/// Whole-state bundle for longest-chain adoption
async fn full_chain(
    State(state): State<AppState>,
) -> std::result::Result<Json<ChainBundle>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "chain");
    Ok(Json(state.node.export_chain()?))
}

// --- operator handlers ---

async fn register(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> std::result::Result<Json<ApiResponse<WalletResponse>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "register");
    let user = state.node.register_user(&request.username, &request.password)?;
    let wallet = state.node.wallets.wallet(&user.wallet_id)?;
    Ok(ApiResponse::ok(
        WalletResponse::from_parts(user, wallet),
        "Account created",
    ))
}

async fn login(
    State(state): State<AppState>,
    Json(request): Json<CredentialsRequest>,
) -> std::result::Result<Json<ApiResponse<WalletResponse>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "login");
    let (user, wallet) = state.node.login(&request.username, &request.password)?;
    Ok(ApiResponse::ok(
        WalletResponse::from_parts(user, wallet),
        "Login successful",
    ))
}

async fn wallet_info(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> std::result::Result<Json<ApiResponse<WalletResponse>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "wallet");
    let (user, wallet) = state.node.wallet_info(&username)?;
    Ok(ApiResponse::ok(
        WalletResponse::from_parts(user, wallet),
        "Wallet retrieved",
    ))
}

async fn transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> std::result::Result<Json<ApiResponse<Transaction>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "transfer");
    let tx = state
        .node
        .transfer(&request.sender, &request.recipient, request.amount)?;
    Ok(ApiResponse::ok(tx, "Transfer recorded"))
}

async fn mine(
    State(state): State<AppState>,
    Json(request): Json<MineRequest>,
) -> std::result::Result<Json<ApiResponse<Block>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "mine");
    let block = state.node.mine(&request.miner).await?;
    Ok(ApiResponse::ok(block, "Block mined"))
}

async fn stats(
    State(state): State<AppState>,
) -> std::result::Result<Json<ApiResponse<LedgerStats>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "stats");
    Ok(ApiResponse::ok(state.node.stats()?, "Statistics retrieved"))
}

async fn register_asset(
    State(state): State<AppState>,
    Json(request): Json<RegisterAssetRequest>,
) -> std::result::Result<Json<ApiResponse<Asset>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "register_asset");
    let asset_type = AssetType::parse(&request.asset_type)?;
    let asset = if asset_type == AssetType::Domain {
        state
            .node
            .register_domain(&request.owner, &request.name, &request.content)?
    } else {
        let content = utils::b64_decode(&request.content)
            .map_err(|_| ApiError::InvalidRequest("media content must be base64".to_string()))?;
        state
            .node
            .register_media(&request.owner, asset_type, &request.name, content)?
    };
    Ok(ApiResponse::ok(asset, "Asset registered"))
}

/// Serve asset content with its MIME type, honoring expiry rules
async fn view_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(params): Query<ViewerParams>,
) -> std::result::Result<Response, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "view_asset");
    let asset = state.node.view_asset(&id, params.viewer.as_deref())?;
    let mime = asset.mime_type();
    Ok(([(header::CONTENT_TYPE, mime)], asset.content).into_response())
}

async fn update_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<UpdateAssetRequest>,
) -> std::result::Result<Json<ApiResponse<Asset>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "update_asset");
    let content = if request.content_base64 {
        utils::b64_decode(&request.content)
            .map_err(|_| ApiError::InvalidRequest("content is not valid base64".to_string()))?
    } else {
        request.content.into_bytes()
    };
    let asset = state.node.update_asset(&id, &request.owner, content)?;
    Ok(ApiResponse::ok(asset, "Content updated"))
}

async fn delete_asset(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(request): Json<OwnerRequest>,
) -> std::result::Result<Json<ApiResponse<()>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "delete_asset");
    state.node.delete_asset(&id, &request.owner)?;
    Ok(ApiResponse::ok((), "Asset deleted"))
}

async fn assets_of(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> std::result::Result<Json<ApiResponse<Vec<Asset>>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "assets_of");
    Ok(ApiResponse::ok(state.node.assets_of(&wallet)?, "Assets retrieved"))
}

async fn search(
    State(state): State<AppState>,
    Query(params): Query<SearchParams>,
) -> std::result::Result<Json<ApiResponse<Vec<Asset>>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "search");
    Ok(ApiResponse::ok(
        state.node.search_domains(&params.q)?,
        "Search complete",
    ))
}

async fn deploy_contract(
    State(state): State<AppState>,
    Json(request): Json<DeployContractRequest>,
) -> std::result::Result<Json<ApiResponse<Contract>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "deploy_contract");
    let contract = state.node.deploy_contract(&request.owner, &request.code)?;
    Ok(ApiResponse::ok(contract, "Contract deployed"))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> std::result::Result<Json<ApiResponse<Contract>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "get_contract");
    Ok(ApiResponse::ok(
        state.node.get_contract(&address)?,
        "Contract retrieved",
    ))
}

async fn call_contract(
    State(state): State<AppState>,
    Path(address): Path<String>,
    Json(request): Json<CallContractRequest>,
) -> std::result::Result<Json<ApiResponse<CallOutcome>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "call_contract");
    let outcome = state.node.call_contract(
        &request.caller,
        &address,
        &request.method,
        &request.args,
    )?;
    Ok(ApiResponse::ok(outcome, "Call complete"))
}

async fn send_message(
    State(state): State<AppState>,
    Json(request): Json<SendMessageRequest>,
) -> std::result::Result<Json<ApiResponse<crate::message::Message>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "send_message");
    let message = state.node.send_message(
        &request.sender,
        &request.recipient,
        &request.content,
        request.asset_id,
    )?;
    Ok(ApiResponse::ok(message, "Message sent"))
}

async fn send_invite(
    State(state): State<AppState>,
    Json(request): Json<InviteRequest>,
) -> std::result::Result<Json<ApiResponse<crate::message::Message>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "invite");
    let message = state.node.send_invite(&request.sender, &request.recipient)?;
    Ok(ApiResponse::ok(message, "Invite sent"))
}

async fn conversation(
    State(state): State<AppState>,
    Path((user, other)): Path<(String, String)>,
) -> std::result::Result<Json<ApiResponse<Vec<ConversationEntry>>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "conversation");
    Ok(ApiResponse::ok(
        state.node.conversation(&user, &other)?,
        "Conversation retrieved",
    ))
}

async fn transactions_for(
    State(state): State<AppState>,
    Path(wallet): Path<String>,
) -> std::result::Result<Json<ApiResponse<Vec<Transaction>>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "transactions");
    Ok(ApiResponse::ok(
        state.node.transactions_for(&wallet, 10)?,
        "Transactions retrieved",
    ))
}

async fn peers_overview(
    State(state): State<AppState>,
) -> std::result::Result<Json<ApiResponse<PeersOverview>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "peers");
    Ok(ApiResponse::ok(state.node.peers_overview()?, "Peers retrieved"))
}

async fn sync_now(
    State(state): State<AppState>,
) -> std::result::Result<Json<ApiResponse<SyncReport>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "sync");
    Ok(ApiResponse::ok(state.node.sync_now().await, "Sync complete"))
}

async fn adopt_chain(
    State(state): State<AppState>,
) -> std::result::Result<Json<ApiResponse<AdoptReport>>, ApiError> {
    counter!("api_requests_total", 1, "endpoint" => "adopt");
    Ok(ApiResponse::ok(
        state.node.adopt_longest_chain().await?,
        "Adoption attempt complete",
    ))
}
