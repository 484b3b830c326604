//! The read-only root-hash HTTP endpoint (component G).

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::sync::Mutex;

use crate::ledger::Ledger;

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Mutex<Ledger>>,
}

#[derive(Debug, Deserialize)]
pub struct RootHashQuery {
    #[serde(rename = "blockNumber")]
    block_number: Option<String>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/rootHash", get(root_hash))
        .with_state(state)
}

async fn root_hash(
    State(state): State<AppState>,
    Query(query): Query<RootHashQuery>,
) -> (StatusCode, String) {
    let block_number_str = match query.block_number {
        Some(s) => s,
        None => return (StatusCode::BAD_REQUEST, "Missing blockNumber parameter".into()),
    };

    let block_number: i64 = match block_number_str.parse() {
        Ok(n) => n,
        Err(_) => return (StatusCode::BAD_REQUEST, "Invalid block number format".into()),
    };

    let ledger = state.ledger.lock().await;
    let last_checked_block = match ledger.get_last_checked_block() {
        Ok(n) => n as i64,
        Err(e) => {
            tracing::warn!(%e, "database error serving rootHash");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into());
        }
    };

    if block_number == last_checked_block {
        match ledger.root_hash() {
            Some(hash) => (StatusCode::OK, hex::encode(hash)),
            None => (StatusCode::BAD_REQUEST, "Root hash not available".into()),
        }
    } else if block_number < last_checked_block && block_number > 1 {
        match ledger.get_block_root_hash(block_number as u64) {
            Ok(Some(bytes)) => (StatusCode::OK, hex::encode(bytes)),
            Ok(None) => (
                StatusCode::BAD_REQUEST,
                format!("Block root hash not found for block number: {block_number}"),
            ),
            Err(e) => {
                tracing::warn!(%e, "database error serving rootHash");
                (StatusCode::INTERNAL_SERVER_ERROR, "Database error".into())
            }
        }
    } else {
        (StatusCode::BAD_REQUEST, "Invalid block number".into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merkle::MerkleStore;
    use axum::body::Body;
    use axum::http::Request;
    use num_bigint::BigUint;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;
    use tower::ServiceExt;

    fn unique_name() -> String {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        format!("http-test-{}", COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    fn test_state() -> (AppState, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = MerkleStore::open_in(dir.path(), &unique_name()).unwrap();
        let ledger = Ledger::new(store);
        (
            AppState {
                ledger: Arc::new(Mutex::new(ledger)),
            },
            dir,
        )
    }

    async fn get(state: AppState, uri: &str) -> (StatusCode, String) {
        let response = router(state)
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn missing_param_is_bad_request() {
        let (state, _dir) = test_state();
        let (status, body) = get(state, "/rootHash").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Missing blockNumber parameter");
    }

    #[tokio::test]
    async fn non_numeric_param_is_bad_request() {
        let (state, _dir) = test_state();
        let (status, body) = get(state, "/rootHash?blockNumber=abc").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid block number format");
    }

    #[tokio::test]
    async fn current_block_returns_root_hash() {
        let (state, _dir) = test_state();
        {
            let mut ledger = state.ledger.lock().await;
            ledger.set_balance(b"a", &BigUint::from(1u32)).unwrap();
            ledger.set_last_checked_block(5).unwrap();
        }
        let (status, body) = get(state.clone(), "/rootHash?blockNumber=5").await;
        assert_eq!(status, StatusCode::OK);
        let expected = {
            let ledger = state.ledger.lock().await;
            hex::encode(ledger.root_hash().unwrap())
        };
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn historical_block_returns_saved_hash() {
        let (state, _dir) = test_state();
        {
            let mut ledger = state.ledger.lock().await;
            ledger.set_balance(b"a", &BigUint::from(1u32)).unwrap();
            ledger.set_block_root_hash(2).unwrap();
            ledger.set_last_checked_block(5).unwrap();
        }
        let (status, body) = get(state.clone(), "/rootHash?blockNumber=2").await;
        assert_eq!(status, StatusCode::OK);
        let expected = {
            let ledger = state.ledger.lock().await;
            hex::encode(ledger.get_block_root_hash(2).unwrap().unwrap())
        };
        assert_eq!(body, expected);
    }

    #[tokio::test]
    async fn unknown_historical_block_is_bad_request() {
        let (state, _dir) = test_state();
        {
            let mut ledger = state.ledger.lock().await;
            ledger.set_last_checked_block(5).unwrap();
        }
        let (status, body) = get(state, "/rootHash?blockNumber=3").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Block root hash not found for block number: 3");
    }

    #[tokio::test]
    async fn block_number_not_greater_than_one_is_invalid() {
        let (state, _dir) = test_state();
        {
            let mut ledger = state.ledger.lock().await;
            ledger.set_last_checked_block(5).unwrap();
        }
        let (status, body) = get(state, "/rootHash?blockNumber=1").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid block number");
    }

    #[tokio::test]
    async fn block_number_ahead_of_checkpoint_is_invalid() {
        let (state, _dir) = test_state();
        {
            let mut ledger = state.ledger.lock().await;
            ledger.set_last_checked_block(5).unwrap();
        }
        let (status, body) = get(state, "/rootHash?blockNumber=9").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Invalid block number");
    }
}
