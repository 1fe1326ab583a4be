use warpsched_core::{
    ArenaStrategy, CudaCatalog, DType, Error, HostDevice, IpcTransport, KernelPlan, LocalTransport,
    Model, PackerKind, ScheduleOptions, Scheduler,
};

fn root(err: &Error) -> &Error {
    match err {
        Error::WithBacktrace { inner, .. } => root(inner),
        e => e,
    }
}

fn scheduler(
    device: HostDevice,
    transport: LocalTransport,
    opts: ScheduleOptions,
) -> Scheduler<HostDevice, LocalTransport, CudaCatalog> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Scheduler::new(device, transport, CudaCatalog::new(), opts)
}

fn default_scheduler() -> Scheduler<HostDevice, LocalTransport, CudaCatalog> {
    scheduler(
        HostDevice::new(4, 16, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions::default(),
    )
}

/// No entry exceeds the device warp budget.
fn assert_warp_budget(plan: &KernelPlan, budget: u32) {
    for entries in &plan.launches {
        for e in entries {
            let warps: u32 = e.seqs.iter().map(|s| s.warps).sum();
            assert!(warps <= budget, "entry of {warps} warps over budget {budget}");
        }
    }
}

/// Every launch argument points into a planned buffer.
fn assert_args_resolve(plan: &KernelPlan) {
    for entries in &plan.launches {
        for e in entries {
            for &arg in &e.args {
                let hit = plan.buf_infos.iter().any(|i| {
                    let base = plan.arena_base + i.offset;
                    arg >= base && arg < base + i.bytes.max(1)
                });
                assert!(hit, "arg {arg:#x} resolves to no BufInfo");
            }
        }
    }
}

#[test]
fn single_transpose_schedules_to_one_entry() {
    let mut m = Model::new("transpose");
    let x = m.tensor("x", &[3, 2048, 96, 128], DType::F32).unwrap();
    let _y = m.transpose("y", x, &[0, 2, 1, 3]).unwrap();

    let mut s = default_scheduler();
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    assert_eq!(plan.num_depths(), 1);
    assert_eq!(s.num_depths(), 1);
    assert_eq!(plan.launches[0].len(), 1);
    assert_eq!(plan.launches[0][0].seqs.len(), 1);
    assert!(plan.kernel_sources[0].contains("Transpose"));
    assert!(plan.kernel_sources[0].contains("[3, 2048, 96, 128]"));
    assert!(plan.kernel_sources[0].contains("perm [0, 2, 1, 3]"));
    assert!(!plan.launches[0][0].kernel.is_empty());
    assert_warp_budget(&plan, 4 * 16);
    assert_args_resolve(&plan);
}

#[test]
fn two_rank_export_import() {
    let t0 = LocalTransport::new(0);
    let t1 = t0.for_rank(1);

    let mut m0 = Model::new("rank0");
    let x = m0.tensor("x", &[4, 4], DType::F32).unwrap();
    m0.export(x, 7).unwrap();
    let mut s0 = scheduler(
        HostDevice::new(2, 16, 1 << 20),
        t0.clone(),
        ScheduleOptions::default(),
    );
    let p0 = s0.schedule(m0, 0, 0, 2).unwrap();

    let mut m1 = Model::new("rank1");
    let _y = m1.import("y", &[4, 4], DType::F32, 0, 7).unwrap();
    let mut s1 = scheduler(
        HostDevice::new(2, 16, 1 << 20),
        t1,
        ScheduleOptions::default(),
    );
    let p1 = s1.schedule(m1, 1, 1, 2).unwrap();

    let i0 = &p0.buf_infos[0];
    assert_eq!(i0.sid, 7);
    assert_eq!(i0.gpu_id, 0);
    let i1 = &p1.buf_infos[0];
    assert_eq!(i1.sid, 7);
    assert_eq!(i1.gpu_id, 0);
    // the published handle is visible through the shared registry
    assert!(t0
        .lookup(0, 7, std::time::Duration::from_millis(1))
        .is_some());
}

#[test]
fn unresolved_import_times_out() {
    let mut m = Model::new("orphan");
    let _y = m.import("y", &[4, 4], DType::F32, 0, 99).unwrap();
    let mut s = scheduler(
        HostDevice::new(2, 16, 1 << 20),
        LocalTransport::new(1),
        ScheduleOptions {
            import_deadline_ms: 10,
            ..Default::default()
        },
    );
    let err = s.schedule(m, 1, 1, 2).unwrap_err();
    assert!(matches!(
        root(&err),
        Error::ImportUnresolved { rank: 0, sid: 99, .. }
    ));
}

#[test]
fn conflicting_sids_rejected() {
    let mut m = Model::new("conflict");
    let a = m.tensor("a", &[4, 4], DType::F32).unwrap();
    let b = m.tensor("b", &[4, 4], DType::F32).unwrap();
    m.export(a, 7).unwrap();
    m.export(b, 7).unwrap();

    let mut s = default_scheduler();
    let err = s.schedule(m, 0, 0, 1).unwrap_err();
    assert!(matches!(root(&err), Error::ExportConflict { sid: 7, .. }));
}

#[test]
fn arena_exhaustion_reported() {
    let mut m = Model::new("oom");
    let a = m.tensor("a", &[64, 64], DType::F32).unwrap();
    let _b = m.relu("b", a).unwrap();
    let mut s = scheduler(
        HostDevice::new(2, 16, 1024),
        LocalTransport::new(0),
        ScheduleOptions::default(),
    );
    let err = s.schedule(m, 0, 0, 1).unwrap_err();
    match root(&err) {
        Error::OutOfDeviceMemory { planned, available } => {
            assert!(*planned > *available);
            assert_eq!(*available, 1024);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

fn chain_model() -> (Model, [warpsched_core::TensorBufId; 3]) {
    let mut m = Model::new("chain");
    let a0 = m.tensor("a0", &[4, 512], DType::F32).unwrap();
    let a1 = m.tensor("a1", &[4, 512], DType::F32).unwrap();
    let b = m.add("b", a0, a1).unwrap(); // depth 0, live 0..1
    let c = m.add("c", b, a0).unwrap(); // depth 1
    let d = m.add("d", c, a0).unwrap(); // depth 2, live 2..3
    let _e = m.add("e", d, a0).unwrap(); // depth 3
    let bufs = [m.get(a0).buf(), m.get(b).buf(), m.get(d).buf()];
    (m, bufs)
}

#[test]
fn disjoint_liveness_reuses_bytes() {
    let (m, [_, b_buf, d_buf]) = chain_model();
    let mut s = default_scheduler();
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    let off = |buf| {
        plan.buf_infos
            .iter()
            .find(|i| i.tbuf == buf)
            .map(|i| i.offset)
            .unwrap()
    };
    assert_eq!(off(b_buf), off(d_buf));
    assert_args_resolve(&plan);
}

#[test]
fn no_reuse_strategy_separates_bytes() {
    let (m, [_, b_buf, d_buf]) = chain_model();
    let mut s = scheduler(
        HostDevice::new(4, 16, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions {
            arena_strategy: ArenaStrategy::NoReuse,
            ..Default::default()
        },
    );
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    let off = |buf| {
        plan.buf_infos
            .iter()
            .find(|i| i.tbuf == buf)
            .map(|i| i.offset)
            .unwrap()
    };
    assert_ne!(off(b_buf), off(d_buf));
}

/// Overlapping-liveness buffers never share bytes: the long-lived input
/// is disjoint from everything else in the chain model.
#[test]
fn overlapping_liveness_stays_disjoint() {
    let (m, [a0_buf, _, _]) = chain_model();
    let mut s = default_scheduler();
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    let a0 = plan.buf_infos.iter().find(|i| i.tbuf == a0_buf).unwrap();
    for other in plan.buf_infos.iter().filter(|i| i.tbuf != a0_buf) {
        let disjoint =
            a0.offset + a0.bytes <= other.offset || other.offset + other.bytes <= a0.offset;
        assert!(disjoint, "long-lived input shares bytes with {:?}", other.tbuf);
    }
}

fn four_parallel_adds() -> Model {
    let mut m = Model::new("parallel");
    for i in 0..4 {
        let a = m.tensor(&format!("a{i}"), &[10, 2048], DType::F32).unwrap();
        let b = m.tensor(&format!("b{i}"), &[10, 2048], DType::F32).unwrap();
        let _ = m.add(&format!("s{i}"), a, b).unwrap();
    }
    m
}

#[test]
fn warp_overflow_opens_second_entry() {
    // Four 10-warp sequences against a 2 SM x 16 warp budget: three fit, the
    // fourth opens a new entry.
    let m = four_parallel_adds();
    let mut s = scheduler(
        HostDevice::new(2, 16, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions::default(),
    );
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    assert_eq!(plan.num_depths(), 1);
    let entries = &plan.launches[0];
    assert_eq!(entries.len(), 2);
    let ids = |e: &warpsched_core::Sched| e.seqs.iter().map(|s| s.id).collect::<Vec<_>>();
    assert_eq!(ids(&entries[0]), vec![0, 1, 2]);
    assert_eq!(ids(&entries[1]), vec![3]);
    assert_eq!(entries[0].seqs.iter().map(|s| s.warps).sum::<u32>(), 30);
    assert_warp_budget(&plan, 32);
}

#[test]
fn partitioned_packer_covers_every_sequence() {
    let m = four_parallel_adds();
    let mut s = scheduler(
        HostDevice::new(2, 16, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions {
            packer: PackerKind::Partitioned,
            ..Default::default()
        },
    );
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    let mut seen: Vec<usize> = plan.launches[0]
        .iter()
        .flat_map(|e| e.seqs.iter().map(|s| s.id))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_warp_budget(&plan, 32);
    assert_args_resolve(&plan);
}

#[test]
fn partitioned_packer_with_in_memory_profiler() {
    use warpsched_core::{PartitionedPacker, Profiler};

    let m = four_parallel_adds();
    let mut s = scheduler(
        HostDevice::new(2, 16, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions::default(),
    )
    .with_packer(Box::new(PartitionedPacker::new(Profiler::in_memory())));
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    let mut seen: Vec<usize> = plan.launches[0]
        .iter()
        .flat_map(|e| e.seqs.iter().map(|s| s.id))
        .collect();
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
    assert_warp_budget(&plan, 32);
}

struct FixedTimer(Option<u64>);

impl warpsched_core::KernelTimer for FixedTimer {
    fn time(&mut self, _source: &str, _symbol: &str, warps: u32) -> Option<u64> {
        self.0.map(|c| c / warps as u64)
    }
}

#[test]
fn profiler_prefers_measurements_over_heuristic() {
    use warpsched_core::Profiler;

    let mut p = Profiler::in_memory().with_timer(Box::new(FixedTimer(Some(6400))));
    p.measure(0xabcd, "__device__ void sq() {}", "sq");
    assert_eq!(p.cost(0xabcd, 4, 1 << 20), 1600);
    // unmeasured signature falls back to the work/warps heuristic
    let h = p.cost(0x1234, 4, 1 << 20);
    assert_eq!(h, (1usize << 20).div_ceil(4 * 32 * 2) as u64);
}

#[test]
fn profiler_timeout_keeps_heuristic() {
    use warpsched_core::Profiler;

    let mut p = Profiler::in_memory().with_timer(Box::new(FixedTimer(None)));
    p.measure(0xabcd, "__device__ void sq() {}", "sq");
    let h = p.cost(0xabcd, 8, 1 << 20);
    assert_eq!(h, (1usize << 20).div_ceil(8 * 32 * 2) as u64);
}

#[test]
fn oversized_sequence_is_infeasible() {
    let mut m = Model::new("big");
    let a = m.tensor("a", &[10, 2048], DType::F32).unwrap();
    let _b = m.relu("b", a).unwrap();
    // 10 warps against a 1 SM x 8 warp budget
    let mut s = scheduler(
        HostDevice::new(1, 8, 8 << 30),
        LocalTransport::new(0),
        ScheduleOptions::default(),
    );
    let err = s.schedule(m, 0, 0, 1).unwrap_err();
    assert!(matches!(
        root(&err),
        Error::PackerInfeasible { warps: 10, budget: 8, .. }
    ));
}

#[test]
fn comm_depth_is_one_barrier_entry() {
    let t0 = LocalTransport::new(0);
    let t1 = t0.for_rank(1);

    // Rank 1 declares the landing buffer first.
    let mut m1 = Model::new("rank1");
    let _r = m1.recv("r", &[4, 512], DType::F32, 0, 5).unwrap();
    let mut s1 = scheduler(HostDevice::new(2, 16, 1 << 24), t1, ScheduleOptions::default());
    let p1 = s1.schedule(m1, 1, 1, 2).unwrap();

    let mut m0 = Model::new("rank0");
    let x = m0.tensor("x", &[4, 512], DType::F32).unwrap();
    let y = m0.relu("y", x).unwrap();
    let _dst = m0.send(y, 1, 5).unwrap();
    let mut s0 = scheduler(HostDevice::new(2, 16, 1 << 24), t0, ScheduleOptions::default());
    let p0 = s0.schedule(m0, 0, 0, 2).unwrap();

    // relu depth, then the hoisted send depth packed as one entry
    assert_eq!(p0.num_depths(), 2);
    assert_eq!(p0.launches[1].len(), 1);
    assert!(p0.launches[1][0].seqs[0].comm);
    assert_eq!(p1.num_depths(), 1);
    assert_eq!(p1.launches[0].len(), 1);
}

fn deterministic_model() -> Model {
    let mut m = Model::new("det");
    let a = m.tensor("a", &[16, 128], DType::F32).unwrap();
    let b = m.tensor("b", &[16, 128], DType::F32).unwrap();
    let c = m.add("c", a, b).unwrap();
    let d = m.mul("d", c, a).unwrap();
    let e = m.relu("e", d).unwrap();
    let t = m.transpose("t", e, &[1, 0]).unwrap();
    let _u = m.scale("u", t, 2.0).unwrap();
    m
}

#[test]
fn identical_models_schedule_identically() {
    let run = || {
        let mut s = default_scheduler();
        s.schedule(deterministic_model(), 0, 0, 1).unwrap()
    };
    let p1 = run();
    let p2 = run();

    assert_eq!(p1.kernel_sources, p2.kernel_sources);
    assert_eq!(p1.num_depths(), p2.num_depths());
    for (e1, e2) in p1
        .launches
        .iter()
        .flatten()
        .zip(p2.launches.iter().flatten())
    {
        assert_eq!(e1.kernel, e2.kernel);
        assert_eq!(e1.grid, e2.grid);
        assert_eq!(e1.block, e2.block);
        assert_eq!(e1.args, e2.args);
        let ids1: Vec<usize> = e1.seqs.iter().map(|s| s.id).collect();
        let ids2: Vec<usize> = e2.seqs.iter().map(|s| s.id).collect();
        assert_eq!(ids1, ids2);
    }
}

#[test]
fn scheduler_is_single_shot() {
    let mut s = default_scheduler();
    s.schedule(deterministic_model(), 0, 0, 1).unwrap();
    let err = s.schedule(deterministic_model(), 0, 0, 1).unwrap_err();
    assert!(matches!(root(&err), Error::AlreadyScheduled));
}

#[test]
fn matmul_pads_operands_and_schedules() {
    let mut m = Model::new("mm");
    let a = m.tensor("a", &[48, 20], DType::F32).unwrap();
    let b = m.tensor("b", &[20, 40], DType::F32).unwrap();
    let c = m.matmul("c", a, b).unwrap();
    assert_eq!(m.get(a).ldims().as_slice(), &[64, 32]);
    assert_eq!(m.get(b).ldims().as_slice(), &[32, 64]);
    assert_eq!(m.get(c).shape().as_slice(), &[48, 40]);

    let mut s = default_scheduler();
    let plan = s.schedule(m, 0, 0, 1).unwrap();
    assert_eq!(plan.num_depths(), 1);
    assert!(plan.kernel_sources[0].contains("Matmul"));
    assert_args_resolve(&plan);
}

#[test]
fn resolver_addresses_land_in_arena() {
    let mut m = Model::new("resolve");
    let a = m.tensor("a", &[8, 64], DType::F32).unwrap();
    let b = m.relu("b", a).unwrap();
    let (a_id, b_id) = (a, b);
    let mut s = default_scheduler();
    let plan = s.schedule(m, 0, 0, 1).unwrap();

    for t in [a_id, b_id] {
        let addr = plan.resolve(t).unwrap();
        assert!(addr >= plan.arena_base);
        assert!(addr < plan.arena_base + plan.arena_bytes);
    }
}
