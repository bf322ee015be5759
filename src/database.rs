//! sled-backed persistence for swap records.
//!
//! One CBOR-serialised [`SwapData`] per swap, keyed by the serialised swap
//! id. Written on every transition, read back on recovery.

use crate::{
    swap::{services::SwapStore, SwapData, SwapDoesNotExist},
    SwapId,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug)]
pub struct Database {
    db: sled::Db,
    #[cfg(test)]
    tmp_dir: Option<tempfile::TempDir>,
}

impl Database {
    pub fn new(path: &std::path::Path) -> Result<Self> {
        let db = sled::open(path)
            .with_context(|| format!("failed to open DB at {}", path.display()))?;

        Ok(Database {
            db,
            #[cfg(test)]
            tmp_dir: None,
        })
    }

    #[cfg(test)]
    pub fn new_test() -> Result<Self> {
        let tmp_dir = tempfile::TempDir::new().unwrap();
        let db = sled::open(tmp_dir.path())
            .with_context(|| format!("failed to open DB at {}", tmp_dir.path().display()))?;

        Ok(Database {
            db,
            tmp_dir: Some(tmp_dir),
        })
    }

    fn get_swap(&self, swap_id: &SwapId) -> Result<Option<SwapData>> {
        let key = serialize(swap_id)?;

        let swap = match self.db.get(&key)? {
            Some(data) => deserialize(&data).context("failed to deserialize swap")?,
            None => return Ok(None),
        };

        Ok(Some(swap))
    }

    fn all_swaps(&self) -> Result<Vec<SwapData>> {
        self.db
            .iter()
            .filter_map(|item| match item {
                Ok((_, value)) => match deserialize::<SwapData>(&value) {
                    Ok(swap) => Some(Ok(swap)),
                    Err(_) => None, // Not a swap item.
                },
                Err(err) => Some(Err(err).context("failed to retrieve swaps from DB")),
            })
            .collect()
    }
}

#[async_trait]
impl SwapStore for Database {
    async fn update_data(&self, swap: &SwapData) -> Result<()> {
        let key = serialize(&swap.id).context("failed to serialize swap id for db storage")?;
        let value = serialize(swap).context("failed to serialize swap value for db storage")?;

        self.db.insert(key, value).context("failed to write in the DB")?;

        self.db
            .flush_async()
            .await
            .map(|_| ())
            .context("failed to flush db")
    }

    fn get_data(&self, swap_id: &SwapId) -> Result<SwapData> {
        self.get_swap(swap_id)?
            .ok_or_else(|| anyhow::Error::new(SwapDoesNotExist))
    }

    fn list_all(&self) -> Result<Vec<SwapData>> {
        self.all_swaps()
    }

    fn list_all_by_peer(&self, peer_id: &str) -> Result<Vec<SwapData>> {
        let swaps = self
            .all_swaps()?
            .into_iter()
            .filter(|swap| swap.peer_node_id == peer_id)
            .collect();

        Ok(swaps)
    }
}

pub fn serialize<T>(t: &T) -> Result<Vec<u8>>
where
    T: Serialize,
{
    Ok(serde_cbor::to_vec(t)?)
}

pub fn deserialize<'a, T>(v: &'a [u8]) -> Result<T>
where
    T: Deserialize<'a>,
{
    Ok(serde_cbor::from_slice(v)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::swap::{data::SwapType, State};
    use tempfile::TempDir;

    fn swap(peer: &str) -> SwapData {
        SwapData::new(SwapId::random(), SwapType::SwapOut, "us", peer)
    }

    #[quickcheck_async::tokio]
    async fn any_swap_id_roundtrips_through_the_store(id: SwapId) -> bool {
        let db = Database::new_test().unwrap();
        let swap = SwapData::new(id, SwapType::SwapIn, "us", "peer-a");

        db.update_data(&swap).await.unwrap();

        db.get_data(&id).unwrap() == swap
    }

    #[tokio::test]
    async fn save_and_retrieve_swaps() {
        let db = Database::new_test().unwrap();
        let swap_1 = swap("peer-a");
        let swap_2 = swap("peer-b");

        db.update_data(&swap_1).await.unwrap();
        db.update_data(&swap_2).await.unwrap();

        let stored_swaps = db.list_all().unwrap();

        assert_eq!(stored_swaps.len(), 2);
        assert!(stored_swaps.contains(&swap_1));
        assert!(stored_swaps.contains(&swap_2));
    }

    #[tokio::test]
    async fn update_overwrites_the_stored_snapshot() {
        let db = Database::new_test().unwrap();
        let mut swap = swap("peer-a");

        db.update_data(&swap).await.unwrap();
        swap.current_state = State::AwaitingAgreement;
        db.update_data(&swap).await.unwrap();

        let stored = db.get_data(&swap.id).unwrap();

        assert_eq!(stored.current_state, State::AwaitingAgreement);
        assert_eq!(db.list_all().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_swaps_are_a_typed_error() {
        let db = Database::new_test().unwrap();

        let result = db.get_data(&SwapId::random());

        assert!(result
            .unwrap_err()
            .downcast_ref::<SwapDoesNotExist>()
            .is_some());
    }

    #[tokio::test]
    async fn list_by_peer_filters() {
        let db = Database::new_test().unwrap();
        let ours = swap("peer-a");

        db.update_data(&ours).await.unwrap();
        db.update_data(&swap("peer-b")).await.unwrap();

        let stored = db.list_all_by_peer("peer-a").unwrap();

        assert_eq!(stored, vec![ours]);
    }

    #[tokio::test]
    async fn data_persists_when_reloading_db() {
        let tmp_dir = TempDir::new().unwrap();
        let path = tmp_dir.path();
        let swap = swap("peer-a");

        {
            let db = Database::new(path).unwrap();
            db.update_data(&swap).await.unwrap();
        }

        {
            let db = Database::new(path).unwrap();
            let stored = db.get_data(&swap.id).unwrap();
            assert_eq!(stored, swap);
        }
    }
}
