//! Sequential read example
//!
//! Reads a two-chunk file front to back over simulated chunk servers, one of
//! which is slow, and prints how the readahead window and the dispatcher
//! behaved.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chunkfs_read::{
    init_tracing, ChunkId, ChunkLayout, ChunkLocation, ChunkPart, ChunkVersion, EngineConfig,
    Inode, MemoryLocator, MemoryTransport, ReadEngine, ServerBehavior, TracingConfig,
};

const CHUNK: u64 = 1 << 20;
const INODE: Inode = Inode(1);

fn server(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 9422))
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing(TracingConfig::default())?;
    println!("=== Sequential Read Example ===\n");

    let transport = Arc::new(MemoryTransport::new(Duration::from_millis(2)));
    let locator = Arc::new(MemoryLocator::new());

    for index in 0..2u32 {
        let chunk_id = ChunkId(u64::from(index) + 1);
        let data = vec![index as u8 + 1; CHUNK as usize];
        for n in 1..=2 {
            transport
                .add_server(server(n))
                .put(chunk_id, ChunkPart::Standard, ChunkVersion(1), data.clone());
        }
        locator.insert_chunk(
            INODE,
            index,
            chunk_id,
            ChunkVersion(1),
            ChunkLayout::Replicated,
            vec![
                ChunkLocation::new(server(1), ChunkPart::Standard),
                ChunkLocation::new(server(2), ChunkPart::Standard),
            ],
        );
    }
    locator.set_file_length(INODE, 2 * CHUNK);

    // The first replica answers, but far slower than a wave
    transport.set_behavior(server(1), ServerBehavior::Delay(Duration::from_millis(300)));

    let config = EngineConfig::default()
        .chunk_size(CHUNK)
        .wave_timeout(Duration::from_millis(50))
        .max_readahead_window(4 << 20);

    println!("Configuration:");
    println!("  Wave timeout: 50 ms");
    println!("  Max readahead: 4 MiB\n");

    let engine = ReadEngine::builder(config)
        .locator(locator)
        .transport(transport)
        .build()?;

    let mut session = engine.open_session(INODE)?;
    let mut offset = 0u64;
    loop {
        let outcome = session.read(offset, 128 * 1024).await?;
        offset += outcome.len() as u64;
        println!(
            "read {:>7} bytes, cursor {:>8}, window {:>8}",
            outcome.len(),
            session.cursor(),
            session.readahead_window()
        );
        if outcome.eof || outcome.is_empty() {
            break;
        }
    }

    let session_stats = session.stats();
    let dispatch = engine.stats().dispatch;
    println!("\nSession:");
    println!("  Bytes delivered: {}", session_stats.bytes_delivered);
    println!("  Prefetch hits: {}", session_stats.prefetch_hits);
    println!("  Cache hits: {}", session_stats.cache_hits);
    println!("Dispatcher:");
    println!("  Attempts: {}", dispatch.attempts);
    println!("  Redundant waves: {}", dispatch.redundant_waves);

    session.close();
    engine.terminate();
    assert_eq!(offset, 2 * CHUNK);
    println!("\n✓ Read completed successfully!");
    Ok(())
}
