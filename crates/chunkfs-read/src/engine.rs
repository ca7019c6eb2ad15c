//! Process-wide read engine
//!
//! [`ReadEngine`] owns the configuration and the shared machinery (cache,
//! governor, dispatcher) and hands out [`ReadSession`]s. It is a cheap
//! clonable handle; there is no global instance.
//!
//! # Example
//!
//! ```ignore
//! let engine = ReadEngine::builder(EngineConfig::from_env()?)
//!     .locator(locator)
//!     .transport(Arc::new(TcpTransport::default()))
//!     .build()?;
//!
//! let mut session = engine.open_session(Inode(7))?;
//! let outcome = session.read(0, 65536).await?;
//! engine.terminate();
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::cache::{CacheStats, ChunkReadCache, ReadCache};
use crate::chunk::Inode;
use crate::config::EngineConfig;
use crate::dispatch::{DispatchStats, WaveDispatcher};
use crate::error::{ConfigError, ReadError, ReadResult};
use crate::governor::{BandwidthGovernor, GovernorStats};
use crate::interest::{InterestCounter, ReadInterestRegistry};
use crate::locator::ChunkLocator;
use crate::reader::ChunkReader;
use crate::session::ReadSession;
use crate::transport::ChunkTransport;
use crate::xor::{PrefetchXorEngine, XorStats};

/// Collaborators the engine reads through
pub struct EngineParts {
    pub locator: Arc<dyn ChunkLocator>,
    pub transport: Arc<dyn ChunkTransport>,
    /// Defaults to an [`InterestCounter`]
    pub interest: Option<Arc<dyn ReadInterestRegistry>>,
    /// Defaults to a [`ChunkReadCache`] sized from the configuration
    pub cache: Option<Arc<dyn ReadCache>>,
}

impl EngineParts {
    pub fn new(locator: Arc<dyn ChunkLocator>, transport: Arc<dyn ChunkTransport>) -> Self {
        Self {
            locator,
            transport,
            interest: None,
            cache: None,
        }
    }
}

/// Engine-wide statistics
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub dispatch: DispatchStats,
    pub governor: GovernorStats,
    pub xor: XorStats,
    /// Present when the engine runs its own cache
    pub cache: Option<CacheStats>,
    pub sessions_opened: u64,
    pub sessions_active: u64,
}

pub(crate) struct EngineShared {
    pub(crate) config: Arc<EngineConfig>,
    pub(crate) locator: Arc<dyn ChunkLocator>,
    pub(crate) interest: Arc<dyn ReadInterestRegistry>,
    pub(crate) cache: Arc<dyn ReadCache>,
    pub(crate) governor: Arc<BandwidthGovernor>,
    pub(crate) dispatcher: Arc<WaveDispatcher>,
    pub(crate) reader: Arc<ChunkReader>,
    own_cache: Option<Arc<ChunkReadCache>>,
    terminated: AtomicBool,
    shutdown: watch::Sender<bool>,
    sessions_opened: AtomicU64,
    sessions_active: AtomicU64,
}

impl EngineShared {
    pub(crate) fn ensure_running(&self) -> ReadResult<()> {
        if self.terminated.load(Ordering::Acquire) {
            Err(ReadError::EngineTerminated)
        } else {
            Ok(())
        }
    }

    /// Resolves to `true` once the engine terminates
    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    pub(crate) fn session_closed(&self) {
        self.sessions_active.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Handle to the client read engine
#[derive(Clone)]
pub struct ReadEngine {
    shared: Arc<EngineShared>,
}

impl ReadEngine {
    /// Validate `config` and assemble the engine
    pub fn init(config: EngineConfig, parts: EngineParts) -> Result<Self, ConfigError> {
        config.validate()?;
        let config = Arc::new(config);

        let (cache, own_cache): (Arc<dyn ReadCache>, _) = match parts.cache {
            Some(cache) => (cache, None),
            None => {
                let cache = Arc::new(ChunkReadCache::new(
                    config.cache_expiration,
                    config.cache_capacity,
                ));
                (cache.clone(), Some(cache))
            }
        };
        let interest = parts
            .interest
            .unwrap_or_else(|| Arc::new(InterestCounter::new()));

        let governor = Arc::new(BandwidthGovernor::new(
            config.bandwidth_overuse,
            config.cache_expiration,
        ));
        let dispatcher = Arc::new(WaveDispatcher::new(
            &config,
            parts.transport,
            Arc::clone(&governor),
        ));
        let xor = PrefetchXorEngine::new(
            Arc::clone(&config),
            Arc::clone(&dispatcher),
            Arc::clone(&cache),
            Arc::clone(&governor),
        );
        let reader = Arc::new(ChunkReader::new(
            Arc::clone(&cache),
            Arc::clone(&dispatcher),
            xor,
        ));

        tracing::info!(
            retries = config.retries,
            wave_ms = config.effective_wave_timeout().as_millis() as u64,
            total_ms = config.total_read_timeout.as_millis() as u64,
            max_readahead = config.max_readahead_window,
            xor_prefetch = config.xor_prefetch,
            "read engine initialised"
        );

        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            shared: Arc::new(EngineShared {
                config,
                locator: parts.locator,
                interest,
                cache,
                governor,
                dispatcher,
                reader,
                own_cache,
                terminated: AtomicBool::new(false),
                shutdown,
                sessions_opened: AtomicU64::new(0),
                sessions_active: AtomicU64::new(0),
            }),
        })
    }

    pub fn builder(config: EngineConfig) -> ReadEngineBuilder {
        ReadEngineBuilder::new(config)
    }

    /// Stop the engine: later calls fail with [`ReadError::EngineTerminated`]
    pub fn terminate(&self) {
        if self.shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.shutdown.send_replace(true);
        self.shared.cache.clear();
        tracing::info!(
            active_sessions = self.shared.sessions_active.load(Ordering::Relaxed),
            "read engine terminated"
        );
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminated.load(Ordering::Acquire)
    }

    pub fn begin_read_interest(&self, inode: Inode) {
        self.shared.interest.acquire(inode);
    }

    pub fn end_read_interest(&self, inode: Inode) {
        self.shared.interest.release(inode);
    }

    /// Start reading `inode`; the session holds read interest until closed
    pub fn open_session(&self, inode: Inode) -> ReadResult<ReadSession> {
        self.shared.ensure_running()?;
        self.begin_read_interest(inode);
        self.shared.sessions_opened.fetch_add(1, Ordering::Relaxed);
        self.shared.sessions_active.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(inode = %inode, "session opened");
        Ok(ReadSession::new(inode, Arc::clone(&self.shared)))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Data-wait budget of one attempt
    pub fn wave_read_timeout(&self) -> Duration {
        self.shared.config.effective_wave_timeout()
    }

    pub fn connect_timeout(&self) -> Duration {
        self.shared.config.connect_timeout
    }

    pub fn total_read_timeout(&self) -> Duration {
        self.shared.config.total_read_timeout
    }

    pub fn prefetch_xor_stripes(&self) -> bool {
        self.shared.config.xor_prefetch
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            dispatch: self.shared.dispatcher.stats(),
            governor: self.shared.governor.stats(),
            xor: self.shared.reader.xor().stats(),
            cache: self.shared.own_cache.as_ref().map(|c| c.stats()),
            sessions_opened: self.shared.sessions_opened.load(Ordering::Relaxed),
            sessions_active: self.shared.sessions_active.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ReadEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadEngine")
            .field("config", &self.shared.config)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

/// Builder for [`ReadEngine`]
pub struct ReadEngineBuilder {
    config: EngineConfig,
    locator: Option<Arc<dyn ChunkLocator>>,
    transport: Option<Arc<dyn ChunkTransport>>,
    interest: Option<Arc<dyn ReadInterestRegistry>>,
    cache: Option<Arc<dyn ReadCache>>,
}

impl ReadEngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            locator: None,
            transport: None,
            interest: None,
            cache: None,
        }
    }

    pub fn locator(mut self, locator: Arc<dyn ChunkLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn ChunkTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn interest(mut self, interest: Arc<dyn ReadInterestRegistry>) -> Self {
        self.interest = Some(interest);
        self
    }

    pub fn cache(mut self, cache: Arc<dyn ReadCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn build(self) -> Result<ReadEngine, ConfigError> {
        let locator = self
            .locator
            .ok_or(ConfigError::MissingCollaborator("locator"))?;
        let transport = self
            .transport
            .ok_or(ConfigError::MissingCollaborator("transport"))?;
        ReadEngine::init(
            self.config,
            EngineParts {
                locator,
                transport,
                interest: self.interest,
                cache: self.cache,
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{ChunkId, ChunkLayout, ChunkLocation, ChunkPart, ChunkVersion};
    use crate::locator::MemoryLocator;
    use crate::transport::memory::MemoryTransport;
    use std::net::SocketAddr;

    fn addr(n: u8) -> SocketAddr {
        SocketAddr::from(([10, 0, 3, n], 9422))
    }

    fn engine_with(interest: Arc<InterestCounter>) -> ReadEngine {
        let transport = Arc::new(MemoryTransport::new(Duration::from_millis(2)));
        transport
            .add_server(addr(1))
            .put(ChunkId(1), ChunkPart::Standard, ChunkVersion(1), vec![9u8; 8192]);
        let locator = Arc::new(MemoryLocator::new());
        locator.insert_chunk(
            Inode(1),
            0,
            ChunkId(1),
            ChunkVersion(1),
            ChunkLayout::Replicated,
            vec![ChunkLocation::new(addr(1), ChunkPart::Standard)],
        );
        locator.set_file_length(Inode(1), 8192);

        ReadEngine::builder(EngineConfig::default())
            .locator(locator)
            .transport(transport)
            .interest(interest)
            .build()
            .unwrap()
    }

    #[test]
    fn test_builder_requires_collaborators() {
        let err = ReadEngine::builder(EngineConfig::default())
            .build()
            .unwrap_err();
        assert!(matches!(err, ConfigError::MissingCollaborator("locator")));
    }

    #[test]
    fn test_init_rejects_invalid_config() {
        let parts = EngineParts::new(
            Arc::new(MemoryLocator::new()),
            Arc::new(MemoryTransport::new(Duration::ZERO)),
        );
        let config = EngineConfig::default().block_size(0);
        assert!(ReadEngine::init(config, parts).is_err());
    }

    #[test]
    fn test_accessors() {
        let engine = engine_with(Arc::new(InterestCounter::new()));
        assert_eq!(engine.wave_read_timeout(), Duration::from_millis(500));
        assert_eq!(engine.connect_timeout(), Duration::from_millis(2000));
        assert_eq!(engine.total_read_timeout(), Duration::from_millis(2000));
        assert!(!engine.prefetch_xor_stripes());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_interest_lifecycle() {
        let interest = Arc::new(InterestCounter::new());
        let engine = engine_with(interest.clone());

        let session = engine.open_session(Inode(1)).unwrap();
        let other = engine.open_session(Inode(1)).unwrap();
        assert_eq!(interest.active(Inode(1)), 2);
        assert_eq!(engine.stats().sessions_active, 2);

        session.close();
        drop(other);
        assert_eq!(interest.active(Inode(1)), 0);
        assert_eq!(engine.stats().sessions_active, 0);
        assert_eq!(engine.stats().sessions_opened, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_blocks_further_reads() {
        let engine = engine_with(Arc::new(InterestCounter::new()));
        let mut session = engine.open_session(Inode(1)).unwrap();
        let outcome = session.read(0, 1024).await.unwrap();
        assert_eq!(outcome.len(), 1024);
        assert!(engine.stats().cache.unwrap().bytes > 0);

        engine.terminate();
        assert!(engine.is_terminated());
        assert_eq!(engine.stats().cache.unwrap().bytes, 0);
        assert!(matches!(
            session.read(0, 1024).await,
            Err(ReadError::EngineTerminated)
        ));
        assert!(matches!(
            engine.open_session(Inode(1)),
            Err(ReadError::EngineTerminated)
        ));
    }
}
