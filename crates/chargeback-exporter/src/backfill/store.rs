//! Block commits into the store's data directory
//!
//! Layout under `<data_dir>/chargeback-backfill/`:
//!
//! ```text
//! staging/                  rendered files and promtool output before publication
//! blocks/<start>-<end>/     directory sink output
//! <start>-<end>.json        manifest, written last
//! ```
//!
//! The promtool sink moves the TSDB blocks it built into `<data_dir>/` and
//! records exactly those directories. A block counts as committed only once
//! its manifest exists.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chargeback_common::{BackfillError, CostBucket, TimeRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::job::BlockPlan;
use super::openmetrics;
use crate::config::{SinkKind, StoreSettings};
use crate::store_api::StoreApiClient;

const BACKFILL_DIR: &str = "chargeback-backfill";

/// Whether an existing manifest with a different digest may be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitMode {
    Create,
    Replace,
}

/// Durable record of one committed block
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockManifest {
    pub range: TimeRange,
    /// blake3 of the rendered block
    pub digest: String,
    pub samples: usize,
    pub committed_at: DateTime<Utc>,
    /// Directories produced in the store data directory
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
    /// Buckets the block was rendered from
    #[serde(default)]
    pub buckets: Vec<CostBucket>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Committed(BlockManifest),
    /// Identical content already committed
    AlreadyPresent(BlockManifest),
}

/// A block plan rendered to its on-disk form
#[derive(Debug, Clone)]
pub struct RenderedBlock {
    pub range: TimeRange,
    pub buckets: Vec<CostBucket>,
    pub body: String,
    pub digest: String,
}

impl RenderedBlock {
    pub fn render(plan: &BlockPlan, prefix: &str) -> Self {
        let body = openmetrics::render(prefix, &plan.buckets);
        let digest = blake3::hash(body.as_bytes()).to_hex().to_string();
        Self {
            range: plan.range,
            buckets: plan.buckets.clone(),
            body,
            digest,
        }
    }

    pub fn name(&self) -> String {
        block_name(&self.range)
    }
}

fn block_name(range: &TimeRange) -> String {
    format!("{}-{}", range.start, range.end)
}

/// Destination of committed blocks
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Check the store can accept blocks
    async fn probe(&self) -> Result<(), BackfillError>;

    /// Manifest of a committed block, if any
    async fn manifest(&self, range: &TimeRange) -> Result<Option<BlockManifest>, BackfillError>;

    /// Commit one block atomically
    async fn commit(&self, block: &RenderedBlock, mode: CommitMode) -> Result<CommitOutcome, BackfillError>;
}

/// How staged files are published
#[derive(Debug, Clone)]
pub enum BlockSink {
    /// Rename into `blocks/<start>-<end>/`
    Directory,
    /// `promtool tsdb create-blocks-from openmetrics`
    Promtool { binary: PathBuf, block_duration_ms: i64 },
}

/// Filesystem-backed block store
pub struct FsBlockStore {
    data_dir: PathBuf,
    staging_dir: PathBuf,
    sink: BlockSink,
    api: Option<StoreApiClient>,
}

impl FsBlockStore {
    pub fn new(data_dir: impl Into<PathBuf>, staging_dir: Option<PathBuf>, sink: BlockSink) -> Self {
        let data_dir = data_dir.into();
        let staging_dir = staging_dir.unwrap_or_else(|| data_dir.join(BACKFILL_DIR).join("staging"));
        Self {
            data_dir,
            staging_dir,
            sink,
            api: None,
        }
    }

    pub fn from_settings(settings: &StoreSettings, block_duration_ms: i64) -> Self {
        let sink = match settings.sink {
            SinkKind::Promtool => BlockSink::Promtool {
                binary: settings.promtool.clone(),
                block_duration_ms,
            },
            SinkKind::Directory => BlockSink::Directory,
        };
        Self::new(&settings.data_dir, settings.staging_dir.clone(), sink)
    }

    /// Probe the store API before each cycle
    pub fn with_api(mut self, api: StoreApiClient) -> Self {
        self.api = Some(api);
        self
    }

    fn backfill_dir(&self) -> PathBuf {
        self.data_dir.join(BACKFILL_DIR)
    }

    fn manifest_path(&self, range: &TimeRange) -> PathBuf {
        self.backfill_dir().join(format!("{}.json", block_name(range)))
    }

    fn block_dir(&self, range: &TimeRange) -> PathBuf {
        self.backfill_dir().join("blocks").join(block_name(range))
    }

    async fn read_manifest(&self, range: &TimeRange) -> Result<Option<BlockManifest>, BackfillError> {
        let path = self.manifest_path(range);
        match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| BackfillError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Publish the rendered body, returning the produced artifacts
    async fn publish(&self, block: &RenderedBlock, previous: Option<&BlockManifest>) -> Result<Vec<PathBuf>, BackfillError> {
        let stage = self
            .staging_dir
            .join(format!("{}-{}", block.name(), Uuid::now_v7()));
        fs::create_dir_all(&stage).await?;
        let staged_file = stage.join("series.om");
        write_synced(&staged_file, block.body.as_bytes()).await?;

        match &self.sink {
            BlockSink::Directory => {
                let target = self.block_dir(&block.range);
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent).await?;
                }
                let retired = if fs::try_exists(&target).await? {
                    let retired = self.staging_dir.join(format!("{}-retired-{}", block.name(), Uuid::now_v7()));
                    fs::rename(&target, &retired).await?;
                    Some(retired)
                } else {
                    None
                };
                fs::rename(&stage, &target).await?;
                if let Some(retired) = retired {
                    fs::remove_dir_all(&retired).await?;
                }
                Ok(vec![target])
            }
            BlockSink::Promtool {
                binary,
                block_duration_ms,
            } => {
                let output_dir = stage.join("tsdb");
                let built = match fs::create_dir_all(&output_dir).await {
                    Ok(()) => run_promtool(binary, *block_duration_ms, &staged_file, &output_dir).await,
                    Err(e) => Err(e.into()),
                };
                let moved = match built {
                    Ok(()) => self.move_blocks(&output_dir).await,
                    Err(e) => Err(e),
                };
                if let Err(e) = fs::remove_dir_all(&stage).await {
                    warn!(path = %stage.display(), error = %e, "Failed to clean staging directory");
                }
                let artifacts = moved?;

                if let Some(previous) = previous {
                    for artifact in previous.artifacts.iter().filter(|a| !artifacts.contains(a)) {
                        if let Err(e) = fs::remove_dir_all(artifact).await {
                            warn!(path = %artifact.display(), error = %e, "Failed to remove replaced block");
                        }
                    }
                }
                Ok(artifacts)
            }
        }
    }

    /// Move the blocks promtool built into the data directory
    async fn move_blocks(&self, output_dir: &Path) -> Result<Vec<PathBuf>, BackfillError> {
        let mut artifacts = Vec::new();
        for block in list_dirs(output_dir).await? {
            let Some(name) = block.file_name() else {
                continue;
            };
            let target = self.data_dir.join(name);
            fs::rename(&block, &target).await?;
            artifacts.push(target);
        }
        if artifacts.is_empty() {
            return Err(BackfillError::StoreUnavailable("promtool produced no blocks".into()));
        }
        artifacts.sort();
        Ok(artifacts)
    }

    /// Fail when the store has compacted away blocks recorded in `manifest`
    async fn ensure_replaceable(&self, manifest: &BlockManifest) -> Result<(), BackfillError> {
        let mut missing = 0;
        for artifact in &manifest.artifacts {
            if !fs::try_exists(artifact).await? {
                missing += 1;
            }
        }
        if missing > 0 {
            return Err(BackfillError::Compacted {
                range: manifest.range,
                missing,
            });
        }
        Ok(())
    }

    async fn write_manifest(&self, manifest: &BlockManifest) -> Result<(), BackfillError> {
        let path = self.manifest_path(&manifest.range);
        let tmp = path.with_extension(format!("json.{}.tmp", Uuid::now_v7()));
        let bytes = serde_json::to_vec_pretty(manifest)
            .map_err(|e| BackfillError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))?;
        write_synced(&tmp, &bytes).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn probe(&self) -> Result<(), BackfillError> {
        if let Some(api) = &self.api {
            api.probe_ready().await?;
        }

        let unavailable = |e: std::io::Error| {
            BackfillError::StoreUnavailable(format!("data directory {} not writable: {}", self.data_dir.display(), e))
        };
        fs::create_dir_all(&self.staging_dir).await.map_err(unavailable)?;
        let marker = self.staging_dir.join(format!(".probe-{}", Uuid::now_v7()));
        fs::write(&marker, b"").await.map_err(unavailable)?;
        fs::remove_file(&marker).await.map_err(unavailable)?;

        if let BlockSink::Promtool { binary, .. } = &self.sink {
            check_promtool(binary).await?;
        }
        Ok(())
    }

    async fn manifest(&self, range: &TimeRange) -> Result<Option<BlockManifest>, BackfillError> {
        self.read_manifest(range).await
    }

    #[instrument(skip(self, block), fields(block = %block.name(), digest = %block.digest))]
    async fn commit(&self, block: &RenderedBlock, mode: CommitMode) -> Result<CommitOutcome, BackfillError> {
        let previous = self.read_manifest(&block.range).await?;
        if let Some(existing) = &previous {
            if existing.digest == block.digest {
                debug!("Block already committed with identical content");
                return Ok(CommitOutcome::AlreadyPresent(existing.clone()));
            }
            if mode == CommitMode::Create {
                return Err(BackfillError::BlockConflict {
                    range: block.range,
                    existing_digest: existing.digest.clone(),
                });
            }
            self.ensure_replaceable(existing).await?;
        }

        fs::create_dir_all(self.backfill_dir()).await?;
        let artifacts = self.publish(block, previous.as_ref()).await?;

        let manifest = BlockManifest {
            range: block.range,
            digest: block.digest.clone(),
            samples: block.buckets.len(),
            committed_at: Utc::now(),
            artifacts,
            buckets: block.buckets.clone(),
        };
        self.write_manifest(&manifest).await?;

        info!(samples = manifest.samples, replaced = previous.is_some(), "Committed backfill block");
        Ok(CommitOutcome::Committed(manifest))
    }
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), BackfillError> {
    let mut file = fs::File::create(path).await?;
    file.write_all(bytes).await?;
    file.sync_all().await?;
    Ok(())
}

async fn list_dirs(dir: &Path) -> Result<Vec<PathBuf>, BackfillError> {
    let mut dirs = Vec::new();
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if entry.file_type().await?.is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn check_promtool(binary: &Path) -> Result<(), BackfillError> {
    let output = Command::new(binary).arg("--version").output().await.map_err(|e| {
        BackfillError::StoreUnavailable(format!("cannot run {}: {}", binary.display(), e))
    })?;
    if output.status.success() {
        Ok(())
    } else {
        Err(BackfillError::StoreUnavailable(format!(
            "{} --version exited with {}",
            binary.display(),
            output.status
        )))
    }
}

async fn run_promtool(binary: &Path, block_duration_ms: i64, input: &Path, output_dir: &Path) -> Result<(), BackfillError> {
    let output = Command::new(binary)
        .arg("tsdb")
        .arg("create-blocks-from")
        .arg("openmetrics")
        .arg(format!("--max-block-duration={}s", block_duration_ms / 1000))
        .arg(input)
        .arg(output_dir)
        .output()
        .await?;

    if output.status.success() {
        Ok(())
    } else {
        Err(BackfillError::StoreUnavailable(format!(
            "promtool exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}
