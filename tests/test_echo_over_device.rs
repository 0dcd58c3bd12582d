//! Both ends of an echo run in one process on the first device, over a QP pair connected to
//! itself. Needs an active InfiniBand port; passes vacuously without one.
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::thread;

use quanta::Clock;
use rdma_echo::config::{BenchConfig, EngineKind, Role};
use rdma_echo::engine::{self, EngineParams, LaneOutcome, LaneTransport, OpMeter};
use rdma_echo::handshake::bring_up::{bring_up, Endpoint, LinkParams};
use rdma_echo::ibverbs::device::DeviceList;
use rdma_echo::ibverbs::device_context::PortState;
use rdma_echo::ibverbs::queue_pair::QueuePairState;
use rdma_echo::resources::{LaneContext, ResourcePlan, Resources};
use rdma_echo::ring::RemoteRing;

use rstest::rstest;

fn active_link() -> Result<Option<LinkParams>, Box<dyn std::error::Error>> {
    let device_list = DeviceList::new()?;
    let Some(device) = device_list.get(0) else {
        return Ok(None);
    };
    let port = device.open()?.query_port(1)?;
    // LID routed fabrics only
    if port.port_state() != PortState::Active || port.lid() == 0 {
        return Ok(None);
    }
    Ok(Some(LinkParams {
        ib_port: 1,
        mtu: port.active_mtu(),
        service_level: 0,
    }))
}

fn run_lane(
    ctx: LaneContext<'_>, remote: RemoteRing, config: &BenchConfig, role: Role,
) -> Result<LaneOutcome, engine::EngineError> {
    let LaneContext {
        qps,
        cq,
        srq,
        rings,
        staging,
        lkey,
        ..
    } = ctx;
    let params = EngineParams {
        role,
        caps: config.capabilities(role),
        rank: 0,
        first_peer: 0,
        batch_size: config.batch_size,
        signal_interval: config.signal_interval,
        warmup_ops: config.warmup_ops,
        total_ops: config.total_ops,
    };
    let meter = OpMeter::new(Clock::new(), Arc::new(AtomicU64::new(0)), config.warmup_ops);
    let mut transport = LaneTransport::new(qps, cq, srq, lkey);
    engine::run(config.engine, &mut transport, &rings, &[remote], &staging, &params, meter)
}

#[rstest]
#[case(EngineKind::TwoSided, 1, false)]
#[case(EngineKind::TwoSided, 1, true)]
#[case(EngineKind::OneSided, 1, false)]
#[case(EngineKind::OneSided, 4, false)]
fn main(
    #[case] engine: EngineKind, #[case] batch_size: usize, #[case] shared_receive_queue: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let Some(link) = active_link()? else {
        return Ok(());
    };
    let config = BenchConfig {
        servers: vec!["server".to_string()],
        clients: vec!["client".to_string()],
        engine,
        batch_size,
        shared_receive_queue,
        signal_interval: 100,
        warmup_ops: 1_000,
        total_ops: 20_000,
        ..BenchConfig::default()
    };
    let plan = |role| -> Result<ResourcePlan, Box<dyn std::error::Error>> {
        Ok(ResourcePlan {
            device: None,
            link,
            rank: 0,
            layout: config.layout(role)?,
            lanes: 1,
            shared_receive_queue: config.capabilities(role).shared_receive_queue,
            send_depth: config.send_queue_depth(),
        })
    };
    let mut server = Resources::open(&plan(Role::Server)?)?;
    let mut client = Resources::open(&plan(Role::Client)?)?;

    let (server_remote, client_remote) = {
        let mut server_eps = server.endpoints();
        let mut client_eps = client.endpoints();
        let server_info = server_eps[0].local_info();
        let client_info = client_eps[0].local_info();
        bring_up(&mut server_eps[0], &client_info, &link)?;
        bring_up(&mut client_eps[0], &server_info, &link)?;
        assert_eq!(server_eps[0].state(), QueuePairState::ReadyToSend);
        assert_eq!(client_eps[0].state(), QueuePairState::ReadyToSend);

        let slots = config.num_concurr_msgs;
        (
            RemoteRing::new(client_info.raddr, client_info.rkey, slots, config.msg_size),
            RemoteRing::new(server_info.raddr, server_info.rkey, slots, config.msg_size),
        )
    };

    let server_lane = server.split().pop().ok_or("server has no lane")?;
    let client_lane = client.split().pop().ok_or("client has no lane")?;
    let (server_outcome, client_outcome) = thread::scope(|s| {
        let client = s.spawn(|| run_lane(client_lane, client_remote, &config, Role::Client));
        let server = s.spawn(|| run_lane(server_lane, server_remote, &config, Role::Server));
        (server.join().unwrap(), client.join().unwrap())
    });
    let (server_outcome, client_outcome) = (server_outcome?, client_outcome?);

    match engine {
        EngineKind::TwoSided => {
            assert_eq!(server_outcome.ops, config.total_ops);
            assert_eq!(client_outcome.ops, config.total_ops - 1);
            assert_eq!(server_outcome.stops_acknowledged, 1);
        },
        EngineKind::OneSided => {
            assert_eq!(server_outcome.ops, config.total_ops);
            assert_eq!(client_outcome.ops, config.total_ops);
            assert_eq!(server_outcome.signaled_completions, config.total_ops / config.signal_interval);
        },
    }
    assert!(server_outcome.throughput.is_some());
    assert!(client_outcome.throughput.is_some());

    client.close();
    server.close();
    Ok(())
}
