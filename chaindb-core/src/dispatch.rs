//! Maps decoded requests onto the distributed database

use crate::distributed::DistributedDatabase;
use crate::error::{DbError, KvError};
use crate::protocol::{ErrorCode, OpCode, Request, Response};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct Dispatcher {
    ddb: Arc<DistributedDatabase>,
}

impl Dispatcher {
    pub fn new(ddb: Arc<DistributedDatabase>) -> Self {
        Self { ddb }
    }

    pub fn database(&self) -> &Arc<DistributedDatabase> {
        &self.ddb
    }

    /// Execute one request. Only successful requests bump the op counter.
    pub async fn dispatch(&self, request: Request) -> Response {
        let op = request.opcode();
        if request.key().is_some_and(str::is_empty) {
            return Response::error(op, ErrorCode::InvalidArgument, KvError::InvalidKey.to_string());
        }

        let result = match request {
            Request::Put { key, value } => self.ddb.put(&key, &value).await.map(|_| Response::Done),
            Request::Get { key } => self.ddb.get(&key).map(Response::Value),
            Request::Del { key } => self.ddb.remove(&key).await.map(|_| Response::Done),
            Request::Size => Ok(Response::Size(self.ddb.size())),
            Request::GetKeys => Ok(Response::Keys(self.ddb.keys())),
            Request::GetTable => Ok(Response::Table(self.ddb.entries())),
            Request::Stats => Ok(Response::Stats(self.ddb.database().stats())),
        };

        match result {
            Ok(response) => {
                self.ddb.database().increment_op_counter();
                response
            }
            Err(e) => {
                debug!("{} failed: {}", op.name(), e);
                error_response(op, &e)
            }
        }
    }
}

fn error_response(op: OpCode, err: &DbError) -> Response {
    let code = match err {
        DbError::Kv(KvError::NotFound(_)) => ErrorCode::NotFound,
        DbError::Kv(KvError::InvalidKey) | DbError::Kv(KvError::InvalidSize(_)) => {
            ErrorCode::InvalidArgument
        }
        DbError::ForwardFailed { .. } => ErrorCode::ForwardFailed,
        _ => ErrorCode::Internal,
    };
    Response::error(op, code, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn dispatcher() -> Dispatcher {
        Dispatcher::new(Arc::new(DistributedDatabase::new(Database::new(4).unwrap())))
    }

    fn op_count(dispatcher: &Dispatcher) -> u64 {
        dispatcher.database().database().stats().op_counter
    }

    #[tokio::test]
    async fn test_put_get_del() {
        let d = dispatcher();
        let put = Request::Put {
            key: "a".into(),
            value: b"1".to_vec(),
        };
        assert_eq!(d.dispatch(put).await, Response::Done);
        assert_eq!(
            d.dispatch(Request::Get { key: "a".into() }).await,
            Response::Value(b"1".to_vec())
        );
        assert_eq!(d.dispatch(Request::Size).await, Response::Size(1));
        assert_eq!(
            d.dispatch(Request::GetKeys).await,
            Response::Keys(vec!["a".to_string()])
        );
        assert_eq!(d.dispatch(Request::Del { key: "a".into() }).await, Response::Done);
        assert_eq!(op_count(&d), 5);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let d = dispatcher();
        let response = d.dispatch(Request::Get { key: "nope".into() }).await;
        assert!(matches!(
            response,
            Response::Error {
                op: OpCode::Get,
                code: ErrorCode::NotFound,
                ..
            }
        ));

        let response = d.dispatch(Request::Del { key: "nope".into() }).await;
        assert!(matches!(
            response,
            Response::Error {
                op: OpCode::Del,
                code: ErrorCode::NotFound,
                ..
            }
        ));
        assert_eq!(op_count(&d), 0);
    }

    #[tokio::test]
    async fn test_empty_key_rejected() {
        let d = dispatcher();
        let response = d
            .dispatch(Request::Put {
                key: String::new(),
                value: b"v".to_vec(),
            })
            .await;
        assert!(matches!(
            response,
            Response::Error {
                code: ErrorCode::InvalidArgument,
                ..
            }
        ));
        assert_eq!(d.dispatch(Request::Size).await, Response::Size(0));
    }

    #[tokio::test]
    async fn test_stats_and_table_count_as_ops() {
        let d = dispatcher();
        d.dispatch(Request::Put {
            key: "k".into(),
            value: b"v".to_vec(),
        })
        .await;

        match d.dispatch(Request::GetTable).await {
            Response::Table(entries) => {
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].key(), "k");
            }
            other => panic!("unexpected response: {:?}", other),
        }

        match d.dispatch(Request::Stats).await {
            Response::Stats(stats) => assert_eq!(stats.op_counter, 2),
            other => panic!("unexpected response: {:?}", other),
        }
        assert_eq!(op_count(&d), 3);
    }
}
