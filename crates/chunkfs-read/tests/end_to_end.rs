//! Session reads through the whole engine over simulated chunk servers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use bytes::Bytes;
use chunkfs_read::transport::memory::{MemoryTransport, ServerBehavior};
use chunkfs_read::xor::xor_into;
use chunkfs_read::{
    CacheKey, ChunkExtent, ChunkId, ChunkLayout, ChunkLocation, ChunkPart, ChunkReadCache,
    ChunkVersion, EngineConfig, Inode, MemoryLocator, ReadCache, ReadEngine, ReadError,
};
use tokio::time::Instant;

const RTT: Duration = Duration::from_millis(10);
const WAVE: Duration = Duration::from_millis(100);
const CHUNK: u64 = 64 * 1024;
const BLOCK: u32 = 4 * 1024;
const INODE: Inode = Inode(7);

fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 1, 0, n], 9422))
}

fn pattern(seed: u8, len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
}

fn config() -> EngineConfig {
    EngineConfig::default()
        .retries(4)
        .round_trip_estimate(RTT)
        .connect_timeout(Duration::from_millis(50))
        .wave_timeout(WAVE)
        .total_read_timeout(Duration::from_millis(1000))
        .cache_expiration(Duration::from_secs(10))
        .chunk_size(CHUNK)
        .block_size(BLOCK)
        .adaptive_readahead(false)
}

/// Config with readahead off so only foreground traffic is counted
fn quiet_config() -> EngineConfig {
    config().max_readahead_window(0)
}

struct Cluster {
    transport: Arc<MemoryTransport>,
    locator: Arc<MemoryLocator>,
}

impl Cluster {
    fn new() -> Self {
        Self {
            transport: Arc::new(MemoryTransport::new(RTT)),
            locator: Arc::new(MemoryLocator::new()),
        }
    }

    /// Replicated chunk `index` of `INODE` on `servers`, all holding `data`
    fn replicated(&self, index: u32, chunk_id: u64, servers: &[u8], data: &[u8]) {
        let mut locations = Vec::new();
        for &n in servers {
            let store = match self.transport.store(addr(n)) {
                Some(store) => store,
                None => self.transport.add_server(addr(n)),
            };
            store.put(
                ChunkId(chunk_id),
                ChunkPart::Standard,
                ChunkVersion(1),
                data.to_vec(),
            );
            locations.push(ChunkLocation::new(addr(n), ChunkPart::Standard));
        }
        self.locator.insert_chunk(
            INODE,
            index,
            ChunkId(chunk_id),
            ChunkVersion(1),
            ChunkLayout::Replicated,
            locations,
        );
    }

    fn engine(&self, config: EngineConfig) -> ReadEngine {
        ReadEngine::builder(config)
            .locator(self.locator.clone())
            .transport(self.transport.clone())
            .build()
            .unwrap()
    }
}

#[tokio::test(start_paused = true)]
async fn test_cached_read_makes_no_attempts() -> Result<()> {
    let cluster = Cluster::new();
    let data = pattern(1, CHUNK as usize);
    cluster.replicated(0, 1, &[1], &data);
    cluster.locator.set_file_length(INODE, CHUNK);

    let cache = Arc::new(ChunkReadCache::new(Duration::from_secs(10), 0));
    cache.store(
        CacheKey::new(ChunkId(1), ChunkPart::Standard),
        ChunkExtent::new(0, Bytes::from(data.clone()), ChunkVersion(1)),
    );
    let engine = ReadEngine::builder(quiet_config())
        .locator(cluster.locator.clone())
        .transport(cluster.transport.clone())
        .cache(cache)
        .build()?;

    let mut session = engine.open_session(INODE)?;
    let outcome = session.read(0, 4096).await?;

    assert_eq!(outcome.len(), 4096);
    assert!(!outcome.eof);
    assert_eq!(&outcome.data[..], &data[..4096]);
    assert_eq!(engine.stats().dispatch.attempts, 0);
    assert_eq!(session.stats().cache_hits, 1);
    assert_eq!(cluster.transport.total_reads(), 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_two_chunks_with_hung_replicas_retry_once_each() -> Result<()> {
    let cluster = Cluster::new();
    let first = pattern(1, CHUNK as usize);
    let second = pattern(2, CHUNK as usize);
    cluster.replicated(0, 1, &[1, 2], &first);
    cluster.replicated(1, 2, &[3, 4], &second);
    cluster.locator.set_file_length(INODE, 2 * CHUNK);
    cluster.transport.set_behavior(addr(1), ServerBehavior::Hang);
    cluster.transport.set_behavior(addr(3), ServerBehavior::Hang);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let started = Instant::now();
    let outcome = session.read(0, 128 * 1024).await?;

    assert_eq!(outcome.len(), 128 * 1024);
    assert_eq!(&outcome.data[..CHUNK as usize], &first[..]);
    assert_eq!(&outcome.data[CHUNK as usize..], &second[..]);
    // Pieces run concurrently: one wave timeout plus one round trip overall
    assert_eq!(started.elapsed(), WAVE + RTT);

    let stats = engine.stats().dispatch;
    assert_eq!(stats.fetches, 2);
    assert_eq!(stats.attempts, 4);
    assert_eq!(stats.redundant_waves, 2);
    for n in 1..=4 {
        assert_eq!(cluster.transport.reads(addr(n)), 1);
    }
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_slow_first_server_loses_the_race() -> Result<()> {
    let cluster = Cluster::new();
    let data = pattern(3, CHUNK as usize);
    cluster.replicated(0, 1, &[1, 2], &data);
    cluster.locator.set_file_length(INODE, CHUNK);
    cluster
        .transport
        .set_behavior(addr(1), ServerBehavior::Delay(Duration::from_millis(150)));

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let started = Instant::now();
    let outcome = session.read(1000, 8192).await?;
    assert_eq!(started.elapsed(), WAVE + RTT);
    assert_eq!(&outcome.data[..], &data[1000..9192]);

    // The late reply arrives after the read and changes nothing
    tokio::time::sleep(Duration::from_millis(200)).await;
    let again = session.read(1000, 8192).await?;
    assert_eq!(again.data, outcome.data);
    assert_eq!(engine.stats().dispatch.attempts, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_always_failing_servers_report_exhaustion() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1, 2], &pattern(4, 1024));
    cluster.locator.set_file_length(INODE, 1024);
    cluster.transport.set_behavior(addr(1), ServerBehavior::Corrupt);
    cluster.transport.set_behavior(addr(2), ServerBehavior::Unreachable);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let started = Instant::now();
    let err = session.read(0, 1024).await.unwrap_err();

    assert!(matches!(
        err,
        ReadError::AllReplicasExhausted { attempts: 4, .. }
    ));
    assert!(started.elapsed() <= engine.total_read_timeout());
    assert_eq!(session.stats().errors, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_hung_servers_hit_total_timeout() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1, 2], &pattern(5, 1024));
    cluster.locator.set_file_length(INODE, 1024);
    cluster.transport.set_behavior(addr(1), ServerBehavior::Hang);
    cluster.transport.set_behavior(addr(2), ServerBehavior::Hang);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let started = Instant::now();
    let err = session.read(0, 1024).await.unwrap_err();

    assert!(matches!(err, ReadError::TotalTimeoutExceeded { .. }));
    assert_eq!(started.elapsed(), engine.total_read_timeout());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_end_of_file_clamps_reads() -> Result<()> {
    let cluster = Cluster::new();
    let first = pattern(6, CHUNK as usize);
    let tail = pattern(7, 34_464);
    cluster.replicated(0, 1, &[1], &first);
    cluster.replicated(1, 2, &[1], &tail);
    cluster.locator.set_file_length(INODE, 100_000);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;

    let outcome = session.read(60_000, 50_000).await?;
    assert!(outcome.eof);
    assert_eq!(outcome.len(), 40_000);
    assert_eq!(&outcome.data[..5536], &first[60_000..]);
    assert_eq!(&outcome.data[5536..], &tail[..]);
    assert_eq!(session.cursor(), 100_000);

    let past = session.read(200_000, 10).await?;
    assert!(past.eof);
    assert!(past.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_holes_and_short_chunks_read_as_zeros() -> Result<()> {
    let cluster = Cluster::new();
    // Chunk 0 is a hole; chunk 1 stores only 1000 bytes
    let stored = pattern(8, 1000);
    cluster.replicated(1, 2, &[1], &stored);
    cluster.locator.set_file_length(INODE, 2 * CHUNK);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;

    let hole = session.read(4096, 4096).await?;
    assert_eq!(hole.len(), 4096);
    assert!(hole.data.iter().all(|&b| b == 0));
    assert_eq!(session.stats().holes, 1);
    assert_eq!(cluster.transport.total_reads(), 0);

    let outcome = session.read(CHUNK + 500, 1000).await?;
    assert_eq!(outcome.len(), 1000);
    assert_eq!(&outcome.data[..500], &stored[500..]);
    assert!(outcome.data[500..].iter().all(|&b| b == 0));
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_version_change_forces_refetch() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1], &pattern(9, 8192));
    cluster.locator.set_file_length(INODE, 8192);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let old = session.read(0, 4096).await?;
    assert_eq!(session.stats().fetches, 1);

    let updated = pattern(10, 8192);
    cluster.transport.store(addr(1)).unwrap().put(
        ChunkId(1),
        ChunkPart::Standard,
        ChunkVersion(2),
        updated.clone(),
    );
    assert!(cluster.locator.set_version(INODE, 0, ChunkVersion(2)));

    let new = session.read(0, 4096).await?;
    assert_ne!(new.data, old.data);
    assert_eq!(&new.data[..], &updated[..4096]);
    assert_eq!(session.stats().fetches, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_sequential_reads_consume_prefetch() -> Result<()> {
    let cluster = Cluster::new();
    let first = pattern(11, CHUNK as usize);
    let second = pattern(12, CHUNK as usize);
    cluster.replicated(0, 1, &[1], &first);
    cluster.replicated(1, 2, &[2], &second);
    cluster.locator.set_file_length(INODE, 2 * CHUNK);

    let engine = cluster.engine(
        config()
            .max_readahead_window(64 * 1024)
            .bandwidth_overuse(4.0),
    );
    let mut session = engine.open_session(INODE)?;

    let head = session.read(0, 32 * 1024).await?;
    assert_eq!(&head.data[..], &first[..32 * 1024]);
    assert_eq!(session.stats().prefetches_issued, 2);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(session.pending_prefetches(), 0);

    let next = session.read(32 * 1024, 32 * 1024).await?;
    assert_eq!(&next.data[..], &first[32 * 1024..]);
    assert_eq!(session.stats().prefetch_hits, 1);
    assert_eq!(session.stats().fetches, 1);
    assert_eq!(cluster.transport.reads(addr(1)), 2);

    // Prefetch crossed into the second chunk
    let crossing = session.read(CHUNK, 16 * 1024).await?;
    assert_eq!(&crossing.data[..], &second[..16 * 1024]);
    assert_eq!(session.stats().prefetch_hits, 2);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unaligned_sequential_reads_stay_off_the_network() -> Result<()> {
    const BIG_CHUNK: u64 = 1 << 20;
    const READ: u32 = 10_000;

    let cluster = Cluster::new();
    let data = pattern(19, BIG_CHUNK as usize);
    cluster.replicated(0, 1, &[1], &data);
    cluster.locator.set_file_length(INODE, BIG_CHUNK);

    let engine = cluster.engine(
        config()
            .chunk_size(BIG_CHUNK)
            .max_readahead_window(256 * 1024)
            .bandwidth_overuse(100.0),
    );
    let mut session = engine.open_session(INODE)?;

    for i in 0..60u64 {
        let offset = i * u64::from(READ);
        let outcome = session.read(offset, READ).await?;
        let at = offset as usize;
        assert_eq!(&outcome.data[..], &data[at..at + READ as usize]);
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Only the first read went to a server; reads straddling two
    // prefetches are served from both
    let stats = session.stats();
    assert_eq!(stats.fetches, 1);
    assert_eq!(stats.cache_hits, 0);
    assert!(stats.prefetch_hits >= 59);
    assert_eq!(
        cluster.transport.reads(addr(1)),
        1 + stats.prefetches_issued
    );
    assert_eq!(engine.stats().dispatch.redundant_waves, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_close_cancels_outstanding_prefetches() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1], &pattern(17, CHUNK as usize));
    cluster.locator.set_file_length(INODE, CHUNK);

    let engine = cluster.engine(config().max_readahead_window(1 << 20).bandwidth_overuse(64.0));
    let mut session = engine.open_session(INODE)?;
    session.read(0, 4096).await?;
    assert_eq!(session.stats().prefetches_issued, 1);
    assert_eq!(engine.stats().cache.unwrap().stores, 1);

    // The prefetch reaches the server and waits on a slow reply
    cluster
        .transport
        .set_behavior(addr(1), ServerBehavior::Delay(Duration::from_millis(300)));
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.pending_prefetches(), 1);
    let reads = cluster.transport.reads(addr(1));
    assert_eq!(reads, 2);

    session.close();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(engine.stats().cache.unwrap().stores, 1);
    assert_eq!(cluster.transport.reads(addr(1)), reads);
    assert_eq!(engine.stats().sessions_active, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_read_leaves_window_untouched() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1], &pattern(18, CHUNK as usize));
    cluster.locator.set_file_length(INODE, CHUNK);
    cluster.transport.set_behavior(addr(1), ServerBehavior::Hang);

    let engine = cluster.engine(config().max_readahead_window(1 << 20).bandwidth_overuse(64.0));
    let mut session = engine.open_session(INODE)?;
    let min = session.readahead().min_window();

    assert!(session.read(0, 4096).await.is_err());
    assert_eq!(session.readahead_window(), min);
    assert_eq!(session.stats().prefetches_issued, 0);

    // The retry at the same offset still counts as the first sequential read
    cluster.transport.set_behavior(addr(1), ServerBehavior::Healthy);
    session.read(0, 4096).await?;
    assert_eq!(session.readahead_window(), 2 * min);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_denied_prefetch_keeps_window_flat() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1], &pattern(13, CHUNK as usize));
    cluster.locator.set_file_length(INODE, CHUNK);

    let engine = cluster.engine(
        config()
            .max_readahead_window(1 << 20)
            .bandwidth_overuse(0.0),
    );
    let mut session = engine.open_session(INODE)?;
    let min = session.readahead().min_window();

    for i in 0..4u64 {
        session.read(i * 4096, 4096).await?;
        assert_eq!(session.readahead_window(), min);
    }

    let stats = session.stats();
    assert_eq!(stats.prefetches_issued, 0);
    assert_eq!(stats.prefetches_denied, 4);
    assert_eq!(engine.stats().governor.admitted, 0);
    Ok(())
}

fn stripe(data: &[u8], level: usize, block: usize) -> (Vec<Vec<u8>>, Vec<u8>) {
    let rows = data.len().div_ceil(block).div_ceil(level);
    let mut parts = vec![vec![0u8; rows * block]; level];
    for (b, chunk) in data.chunks(block).enumerate() {
        let at = (b / level) * block;
        parts[b % level][at..at + chunk.len()].copy_from_slice(chunk);
    }
    let mut parity = vec![0u8; rows * block];
    for part in &parts {
        xor_into(&mut parity, part);
    }
    (parts, parity)
}

fn xor_chunk(cluster: &Cluster, data: &[u8]) {
    let level = 2u8;
    let (parts, parity) = stripe(data, usize::from(level), BLOCK as usize);
    let mut locations = Vec::new();
    for (i, part) in parts.into_iter().enumerate() {
        let chunk_part = ChunkPart::XorData {
            level,
            index: i as u8,
        };
        let server = addr(20 + i as u8);
        cluster
            .transport
            .add_server(server)
            .put(ChunkId(5), chunk_part, ChunkVersion(1), part);
        locations.push(ChunkLocation::new(server, chunk_part));
    }
    let parity_part = ChunkPart::XorParity { level };
    cluster
        .transport
        .add_server(addr(30))
        .put(ChunkId(5), parity_part, ChunkVersion(1), parity);
    locations.push(ChunkLocation::new(addr(30), parity_part));

    cluster.locator.insert_chunk(
        INODE,
        0,
        ChunkId(5),
        ChunkVersion(1),
        ChunkLayout::XorStriped { level },
        locations,
    );
    cluster.locator.set_file_length(INODE, data.len() as u64);
}

#[tokio::test(start_paused = true)]
async fn test_xor_read_survives_a_lost_part() -> Result<()> {
    let cluster = Cluster::new();
    let data = pattern(14, 32 * 1024);
    xor_chunk(&cluster, &data);
    cluster.transport.set_behavior(addr(21), ServerBehavior::Unreachable);

    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;
    let outcome = session.read(1000, 20_000).await?;

    assert_eq!(&outcome.data[..], &data[1000..21_000]);
    assert_eq!(engine.stats().xor.reconstructions, 1);
    assert_eq!(cluster.transport.reads(addr(30)), 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_xor_readahead_prefetches_parity() -> Result<()> {
    let cluster = Cluster::new();
    let data = pattern(15, 64 * 1024);
    xor_chunk(&cluster, &data);

    let engine = cluster.engine(
        config()
            .max_readahead_window(16 * 1024)
            .bandwidth_overuse(8.0)
            .xor_prefetch(true),
    );
    assert!(engine.prefetch_xor_stripes());
    let mut session = engine.open_session(INODE)?;

    session.read(0, 8192).await?;
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stats = engine.stats();
    assert_eq!(stats.xor.parity_prefetches, 1);
    assert!(stats.cache.unwrap().parity_bytes > 0);

    // Prefetched stripes serve the next read even with a data server down
    cluster.transport.set_behavior(addr(20), ServerBehavior::Unreachable);
    let outcome = session.read(8192, 16 * 1024).await?;
    assert_eq!(&outcome.data[..], &data[8192..24_576]);
    assert_eq!(session.stats().prefetch_hits, 1);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_terminate_ends_sessions() -> Result<()> {
    let cluster = Cluster::new();
    cluster.replicated(0, 1, &[1], &pattern(16, CHUNK as usize));
    cluster.locator.set_file_length(INODE, CHUNK);

    let engine = cluster.engine(config().max_readahead_window(1 << 20).bandwidth_overuse(64.0));
    let mut session = engine.open_session(INODE)?;
    session.read(0, 4096).await?;
    assert!(session.last_buffer().is_some());
    session.release_buffer();
    assert!(session.last_buffer().is_none());

    engine.terminate();
    assert!(matches!(
        session.read(4096, 4096).await,
        Err(ReadError::EngineTerminated)
    ));
    session.close();
    assert_eq!(engine.stats().sessions_active, 0);
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_overflowing_range_is_rejected() -> Result<()> {
    let cluster = Cluster::new();
    cluster.locator.set_file_length(INODE, 0);
    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(INODE)?;

    assert!(matches!(
        session.read(u64::MAX - 10, 100).await,
        Err(ReadError::InvalidRequest(_))
    ));
    assert!(session.read(0, 0).await?.is_empty());
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_unknown_inode_surfaces_locator_error() -> Result<()> {
    let cluster = Cluster::new();
    let engine = cluster.engine(quiet_config());
    let mut session = engine.open_session(Inode(99))?;
    assert!(matches!(
        session.read(0, 10).await,
        Err(ReadError::Locator(_))
    ));
    Ok(())
}
