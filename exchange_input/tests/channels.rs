use std::{
    num::NonZeroUsize,
    sync::Arc,
    time::{Duration, Instant},
};

use clap::Parser;
use exchange_clap_blocks::partition_request::PartitionRequestConfig;
use exchange_id::{ChannelIndex, PartitionSlot, ProducerId, ResultPartitionId, SubpartitionIndex};
use exchange_input::{
    BackoffConfig, Buffer, BufferPool, ChannelConfig, ChannelKind, InputChannel, InputChannelError,
    ProducerLocation, ResultPartition, SingleInputGate,
    channel::remote::{DeliveryOutcome, RemoteChannelState},
    testing::{TestResources, connection_id, test_resources},
};

fn partition_ids(n: u32) -> Vec<ResultPartitionId> {
    let producer = ProducerId::new();
    (0..n)
        .map(|slot| ResultPartitionId::new(producer, PartitionSlot::new(slot)))
        .collect()
}

fn gate_with(
    partitions: &[ResultPartitionId],
    config: ChannelConfig,
) -> (SingleInputGate, TestResources) {
    let resources = test_resources();
    let gate = SingleInputGate::with_unknown_channels(
        partitions.iter().copied(),
        SubpartitionIndex::new(0),
        config,
        resources.resources.clone(),
    );
    (gate, resources)
}

fn remote(gate: &SingleInputGate, index: usize) -> Arc<exchange_input::RemoteInputChannel> {
    match gate.channel(ChannelIndex::new(index)) {
        Some(InputChannel::Remote(remote)) => remote,
        other => panic!("expected remote channel, got {other:?}"),
    }
}

#[test_log::test(tokio::test)]
async fn remote_channel_retries_until_partition_is_produced() {
    let config = ChannelConfig::new(
        BackoffConfig::new(Duration::from_millis(10), Duration::from_millis(1000)).unwrap(),
    );
    let ids = partition_ids(1);
    let (gate, resources) = gate_with(&ids, config);
    let client = resources.connections.client();
    client.fail_requests(3);

    gate.update_input_channel(ids[0], ProducerLocation::Remote(connection_id(1)))
        .await
        .unwrap();
    let channel = remote(&gate, 0);
    assert_eq!(channel.identity().channel_index(), ChannelIndex::new(0));
    assert_eq!(channel.identity().partition_id(), ids[0]);

    let start = Instant::now();
    gate.request_partitions().await.unwrap();
    tokio::time::timeout(Duration::from_secs(5), client.wait_for_success())
        .await
        .unwrap();
    let elapsed = start.elapsed();

    // 10ms + 20ms + 40ms of backoff before the fourth request
    assert!(elapsed >= Duration::from_millis(70), "{elapsed:?}");
    assert_eq!(client.requests().len(), 4);
    assert_eq!(client.successful_requests(), 1);
    assert_eq!(channel.current_backoff(), Duration::from_millis(40));

    assert_eq!(
        channel.on_buffer(Buffer::data("first"), 0),
        DeliveryOutcome::Accepted
    );
    assert_eq!(channel.current_backoff(), Duration::ZERO);
    let (index, next) = gate.next_buffer().await.unwrap().unwrap();
    assert_eq!(index, ChannelIndex::new(0));
    assert_eq!(next.buffer.bytes().as_ref(), b"first");
}

#[test_log::test(tokio::test)]
async fn local_channel_reads_produced_subpartition() {
    let ids = partition_ids(1);
    let (gate, resources) = gate_with(&ids, ChannelConfig::default());

    let partition = Arc::new(ResultPartition::new(ids[0], 2));
    partition.add(SubpartitionIndex::new(0), Buffer::data("one"));
    partition.add(SubpartitionIndex::new(0), Buffer::data("two"));
    partition.add(SubpartitionIndex::new(1), Buffer::data("other consumer"));
    partition.finish();
    resources.partitions.register_partition(partition);

    gate.update_input_channel(ids[0], ProducerLocation::Local)
        .await
        .unwrap();
    gate.request_partitions().await.unwrap();

    let channel = gate.channel(ChannelIndex::new(0)).unwrap();
    assert_eq!(channel.kind(), ChannelKind::Local);

    let first = channel.get_next_buffer().unwrap().unwrap();
    assert_eq!(first.buffer.bytes().as_ref(), b"one");
    assert!(first.more_available);
    let second = channel.get_next_buffer().unwrap().unwrap();
    assert_eq!(second.buffer.bytes().as_ref(), b"two");

    let end = channel.get_next_buffer().unwrap().unwrap();
    assert!(end.buffer.is_end_of_partition());
    for _ in 0..3 {
        assert!(channel.get_next_buffer().unwrap().is_none());
    }
}

#[test_log::test(tokio::test)]
async fn unresolved_channels_never_finish_the_gate() {
    let ids = partition_ids(2);
    let (gate, _resources) = gate_with(&ids, ChannelConfig::default());
    gate.request_partitions().await.unwrap();

    for channel in gate.channels() {
        assert_eq!(channel.kind(), ChannelKind::Unknown);
        assert!(!channel.is_released());
        assert!(matches!(
            channel.get_next_buffer(),
            Err(InputChannelError::Unresolved { .. })
        ));
    }
    assert!(!gate.is_finished());
    assert_eq!(gate.number_of_uninitialized_channels(), 2);

    gate.release_all_resources();
    assert!(gate.channels().iter().all(|c| !c.is_released()));
    assert!(!gate.is_finished());
    assert!(gate.next_buffer().await.unwrap().is_none());
}

#[test_log::test(tokio::test)]
async fn release_during_backoff_discards_later_deliveries() {
    let config = ChannelConfig::new(
        BackoffConfig::new(Duration::from_millis(30), Duration::from_secs(1)).unwrap(),
    );
    let ids = partition_ids(1);
    let (gate, resources) = gate_with(&ids, config);
    let client = resources.connections.client();
    client.fail_requests(1);

    gate.update_input_channel(ids[0], ProducerLocation::Remote(connection_id(3)))
        .await
        .unwrap();
    gate.request_partitions().await.unwrap();
    let channel = remote(&gate, 0);
    assert_eq!(channel.state(), RemoteChannelState::Backoff);

    let releaser = {
        let channel = Arc::clone(&channel);
        tokio::spawn(async move { channel.release_all_resources() })
    };
    releaser.await.unwrap();
    tokio::time::sleep(Duration::from_millis(60)).await;

    assert!(channel.is_released());
    assert_eq!(client.requests().len(), 1);
    assert_eq!(client.successful_requests(), 0);
    assert_eq!(client.closed(), vec![channel.id()]);

    let pool = BufferPool::new(2);
    assert_eq!(
        channel.on_buffer(pool.try_lease("late").unwrap(), 0),
        DeliveryOutcome::Discarded
    );
    assert_eq!(pool.leased(), 0);
    assert!(channel.get_next_buffer().unwrap().is_none());
    assert!(gate.is_finished());
}

#[test_log::test(tokio::test)]
async fn backpressure_is_lifted_by_the_gate() {
    let config = ChannelConfig::default().with_queue_capacity(NonZeroUsize::new(1).unwrap());
    let ids = partition_ids(1);
    let (gate, resources) = gate_with(&ids, config);
    gate.update_input_channel(ids[0], ProducerLocation::Remote(connection_id(1)))
        .await
        .unwrap();
    gate.request_partitions().await.unwrap();
    let channel = remote(&gate, 0);

    assert_eq!(
        channel.on_buffer(Buffer::data("a"), 0),
        DeliveryOutcome::Backpressured
    );
    let (_, next) = gate.poll_next().unwrap().unwrap();
    assert_eq!(next.buffer.bytes().as_ref(), b"a");
    assert_eq!(channel.state(), RemoteChannelState::Receiving);
    assert_eq!(resources.connections.client().resumed(), vec![channel.id()]);

    assert_eq!(
        channel.on_buffer(Buffer::end_of_partition(), 1),
        DeliveryOutcome::Backpressured
    );
    let (_, end) = gate.poll_next().unwrap().unwrap();
    assert!(end.buffer.is_end_of_partition());
    assert!(gate.is_finished());
}

#[test_log::test(tokio::test)]
async fn channel_config_from_cli() {
    let cli = PartitionRequestConfig::parse_from([
        "exchange",
        "--partition-request-initial-backoff",
        "5ms",
        "--partition-request-max-backoff",
        "20ms",
        "--partition-request-max-attempts",
        "2",
    ]);
    let config = ChannelConfig::try_from(&cli).unwrap();
    assert_eq!(config.backoff.initial(), Duration::from_millis(5));

    let ids = partition_ids(1);
    let (gate, _resources) = gate_with(&ids, config);
    gate.update_input_channel(ids[0], ProducerLocation::Local)
        .await
        .unwrap();
    gate.request_partitions().await.unwrap();

    let err = tokio::time::timeout(Duration::from_secs(5), gate.next_buffer())
        .await
        .unwrap()
        .unwrap_err();
    assert!(err.to_string().contains("after 2 request attempts"), "{err}");
}
