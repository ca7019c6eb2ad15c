//! Reads over real localhost chunk servers

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chunkfs_read::{
    ChunkId, ChunkLayout, ChunkLocation, ChunkPart, ChunkServer, ChunkServerConfig, ChunkVersion,
    EngineConfig, Inode, MemoryChunkStore, MemoryLocator, ReadEngine, TcpTransport,
};
use tokio::net::TcpListener;

const BLOCK: u32 = 4096;
const CHUNK: u64 = 64 * 1024;
const INODE: Inode = Inode(3);

async fn start_server() -> Result<(SocketAddr, Arc<MemoryChunkStore>)> {
    let store = Arc::new(MemoryChunkStore::new());
    let config = ChunkServerConfig {
        block_size: BLOCK,
        ..ChunkServerConfig::default()
    };
    let server = ChunkServer::bind(config, store.clone()).await?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok((addr, store))
}

/// An address nothing listens on
async fn dead_address() -> Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);
    Ok(addr)
}

fn engine(locator: Arc<MemoryLocator>) -> Result<ReadEngine> {
    let config = EngineConfig::default()
        .retries(3)
        .round_trip_estimate(Duration::from_millis(50))
        .connect_timeout(Duration::from_millis(500))
        .wave_timeout(Duration::from_millis(500))
        .total_read_timeout(Duration::from_secs(5))
        .chunk_size(CHUNK)
        .block_size(BLOCK)
        .max_readahead_window(0);
    Ok(ReadEngine::builder(config)
        .locator(locator)
        .transport(Arc::new(TcpTransport::new(BLOCK)))
        .build()?)
}

fn file_bytes(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 241) as u8).collect()
}

fn standard(addr: SocketAddr) -> ChunkLocation {
    ChunkLocation::new(addr, ChunkPart::Standard)
}

#[tokio::test]
async fn test_whole_file_over_tcp() -> Result<()> {
    let (first, first_store) = start_server().await?;
    let (second, second_store) = start_server().await?;
    let data = file_bytes(100_000);
    let split = CHUNK as usize;

    first_store.put(
        ChunkId(1),
        ChunkPart::Standard,
        ChunkVersion(1),
        data[..split].to_vec(),
    );
    second_store.put(
        ChunkId(2),
        ChunkPart::Standard,
        ChunkVersion(1),
        data[split..].to_vec(),
    );

    let locator = Arc::new(MemoryLocator::new());
    locator.insert_chunk(
        INODE,
        0,
        ChunkId(1),
        ChunkVersion(1),
        ChunkLayout::Replicated,
        vec![standard(first)],
    );
    locator.insert_chunk(
        INODE,
        1,
        ChunkId(2),
        ChunkVersion(1),
        ChunkLayout::Replicated,
        vec![standard(second)],
    );
    locator.set_file_length(INODE, data.len() as u64);

    let engine = engine(locator)?;
    let mut session = engine.open_session(INODE)?;
    let outcome = session.read(0, 128 * 1024).await?;

    assert!(outcome.eof);
    assert_eq!(outcome.data.len(), data.len());
    assert_eq!(&outcome.data[..], &data[..]);
    assert_eq!(engine.stats().dispatch.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_failover_past_dead_server() -> Result<()> {
    let (live, store) = start_server().await?;
    let dead = dead_address().await?;
    let data = file_bytes(20_000);
    store.put(ChunkId(5), ChunkPart::Standard, ChunkVersion(1), data.clone());

    let locator = Arc::new(MemoryLocator::new());
    locator.insert_chunk(
        INODE,
        0,
        ChunkId(5),
        ChunkVersion(1),
        ChunkLayout::Replicated,
        vec![standard(dead), standard(live)],
    );
    locator.set_file_length(INODE, data.len() as u64);

    let engine = engine(locator)?;
    let mut session = engine.open_session(INODE)?;
    let outcome = session.read(1000, 10_000).await?;

    assert_eq!(&outcome.data[..], &data[1000..11_000]);
    let stats = engine.stats().dispatch;
    assert_eq!(stats.connect_failures, 1);
    assert_eq!(stats.attempts, 2);
    Ok(())
}

#[tokio::test]
async fn test_stale_replica_is_skipped() -> Result<()> {
    let (stale, stale_store) = start_server().await?;
    let (current, current_store) = start_server().await?;
    let old = vec![1u8; 8192];
    let new = file_bytes(8192);
    stale_store.put(ChunkId(9), ChunkPart::Standard, ChunkVersion(1), old);
    current_store.put(ChunkId(9), ChunkPart::Standard, ChunkVersion(2), new.clone());

    let locator = Arc::new(MemoryLocator::new());
    locator.insert_chunk(
        INODE,
        0,
        ChunkId(9),
        ChunkVersion(2),
        ChunkLayout::Replicated,
        vec![standard(stale), standard(current)],
    );
    locator.set_file_length(INODE, 8192);

    let engine = engine(locator)?;
    let mut session = engine.open_session(INODE)?;
    let outcome = session.read(0, 8192).await?;

    assert_eq!(&outcome.data[..], &new[..]);
    assert_eq!(engine.stats().dispatch.version_mismatches, 1);
    Ok(())
}
