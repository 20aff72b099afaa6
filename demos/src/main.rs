use std::sync::Arc;

use meshkv::cluster::Node;
use meshkv::config::CacheConfig;
use meshkv::error::Error;
use meshkv::net::transport::local::Registry;
use meshkv::txn::{ConcurrencyMode, IsolationLevel};

#[tokio::main]
async fn main() {
    println!("Hello, meshkv!");

    run().await.unwrap();

    println!("Bye~");
}

async fn run() -> Result<(), Error> {
    let registry = Registry::new();
    let config = CacheConfig {
        partitions: 16,
        ..CacheConfig::default()
    };

    let node1 = Node::new(1, config.clone(), Arc::new(registry.register(1).await))?;
    node1.put(b"order_1".to_vec(), b"placed".to_vec()).await?;
    node1.put(b"order_2".to_vec(), b"placed".to_vec()).await?;

    let node2 = Node::join(2, config.clone(), Arc::new(registry.register(2).await))?;
    let node3 = Node::join(3, config, Arc::new(registry.register(3).await))?;

    node1.rebalance(2, vec![1, 2, 3]).await?;

    // Every node answers reads for keys it doesn't own by forwarding to the
    // owner, so this reads the same value regardless of which node placed it.
    assert_eq!(node3.get(b"order_1").await?, Some(b"placed".to_vec()));

    let tx = node1.begin_transaction(ConcurrencyMode::Pessimistic, IsolationLevel::ReadCommitted).await;
    node1.tx_put(tx, b"order_1".to_vec(), b"shipped".to_vec()).await?;
    node1.commit_transaction(tx).await?;

    assert_eq!(node2.get(b"order_1").await?, Some(b"shipped".to_vec()));

    for node in [&node1, &node2, &node3] {
        println!("{}", node.status());
    }

    Ok(())
}
