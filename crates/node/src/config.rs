//! Node Configuration

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};
use sqlchain::{Block, BlockHash};
use std::path::Path;
use std::time::Duration;

/// Node configuration, stored as JSON
///
/// Every member of a chain must share `period_ms`, `members` and
/// `genesis_block`; `producer_seed` is private to the node.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Production slot length in milliseconds
    pub period_ms: u64,
    /// Ed25519 seed of the local producer (base58)
    pub producer_seed: Option<String>,
    /// Producer public keys in rotation order (base58)
    pub members: Vec<String>,
    /// Borsh-encoded genesis block (base58)
    pub genesis_block: Option<String>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            producer_seed: None,
            members: Vec::new(),
            genesis_block: None,
        }
    }
}

impl NodeConfig {
    /// Load the config at `path`, or create a single-producer chain config there
    pub fn load_or_create(path: &Path, genesis_time: Option<DateTime<Utc>>) -> Result<Self> {
        if path.exists() {
            let data = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config {:?}", path))?;
            let config: Self = serde_json::from_str(&data)
                .with_context(|| format!("Failed to parse config {:?}", path))?;
            tracing::info!("Loaded node config from {:?}", path);
            return Ok(config);
        }

        let config = Self::solo(genesis_time.unwrap_or_else(Utc::now))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(&config)?)?;
        tracing::info!("Created node config at {:?}", path);

        Ok(config)
    }

    /// Fresh chain with a random producer that is its only member
    pub fn solo(genesis_time: DateTime<Utc>) -> Result<Self> {
        let seed: [u8; 32] = rand::random();
        let key = SigningKey::from_bytes(&seed);
        let genesis = Block::genesis(BlockHash::ZERO, genesis_time, &key)?;

        Ok(Self {
            producer_seed: Some(bs58::encode(seed).into_string()),
            members: vec![bs58::encode(key.verifying_key().to_bytes()).into_string()],
            genesis_block: Some(bs58::encode(genesis.to_bytes()?).into_string()),
            ..Default::default()
        })
    }

    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }

    /// Local signing key, if the node produces
    pub fn signing_key(&self) -> Result<Option<SigningKey>> {
        self.producer_seed
            .as_deref()
            .map(|seed| decode_array(seed, "producer_seed").map(|s| SigningKey::from_bytes(&s)))
            .transpose()
    }

    pub fn member_keys(&self) -> Result<Vec<[u8; 32]>> {
        self.members
            .iter()
            .map(|member| decode_array(member, "members"))
            .collect()
    }

    pub fn genesis(&self) -> Result<Block> {
        let encoded = self
            .genesis_block
            .as_deref()
            .ok_or_else(|| anyhow!("Config has no genesis_block"))?;
        let bytes = bs58::decode(encoded)
            .into_vec()
            .context("Invalid base58 in genesis_block")?;

        Ok(Block::from_bytes(&bytes)?)
    }
}

fn decode_array(encoded: &str, field: &str) -> Result<[u8; 32]> {
    let bytes = bs58::decode(encoded)
        .into_vec()
        .with_context(|| format!("Invalid base58 in {}", field))?;

    bytes
        .try_into()
        .map_err(|b: Vec<u8>| anyhow!("{} entry has {} bytes, expected 32", field, b.len()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_solo_config_is_consistent() {
        let config = NodeConfig::solo(Utc::now()).unwrap();

        let key = config.signing_key().unwrap().unwrap();
        let members = config.member_keys().unwrap();
        let genesis = config.genesis().unwrap();

        assert_eq!(members, vec![key.verifying_key().to_bytes()]);
        assert_eq!(genesis.header().producer(), &members[0]);
        genesis.verify_as_genesis(&BlockHash::ZERO).unwrap();
    }

    #[test]
    fn test_load_or_create_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("node.json");

        let created = NodeConfig::load_or_create(&path, None).unwrap();
        let loaded = NodeConfig::load_or_create(&path, None).unwrap();

        assert_eq!(created.genesis_block, loaded.genesis_block);
        assert_eq!(created.producer_seed, loaded.producer_seed);
        assert_eq!(loaded.period(), Duration::from_secs(1));
    }

    #[test]
    fn test_missing_fields_use_defaults() {
        let config: NodeConfig = serde_json::from_str(r#"{"period_ms": 250}"#).unwrap();

        assert_eq!(config.period(), Duration::from_millis(250));
        assert!(config.signing_key().unwrap().is_none());
        assert!(config.genesis().is_err());
    }

    #[test]
    fn test_rejects_short_key() {
        let config = NodeConfig {
            members: vec![bs58::encode([1u8; 16]).into_string()],
            ..Default::default()
        };
        assert!(config.member_keys().is_err());
    }
}
