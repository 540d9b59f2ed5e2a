//! Ready queue and priority bitmap benchmarks
//!
//! Run with: cargo bench -p chcore-kernel

use chcore_kernel::sched::{PrioBitmap, ReadyQueue};
use chcore_kernel::{Badge, CapGroupArgs, Kernel, KernelConfig, Object, ObjectType, SimPlatform};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;

/// Queue entries backed by real kernel objects.
fn objects(count: usize) -> (Kernel, Vec<Arc<Object>>) {
    let mut config = KernelConfig::default();
    config.sched.cpus = 1;
    let kernel = Kernel::new(config, Arc::new(SimPlatform::default()));
    let root = kernel
        .create_root_task(
            CapGroupArgs {
                name: "bench".into(),
                badge: Badge(1),
                pid: 1,
            },
            0,
        )
        .unwrap();
    let objs = (0..count)
        .map(|_| {
            let cap = kernel.sys_create_notification(0).unwrap();
            kernel
                .obj_get(&root.group, cap, ObjectType::Notification)
                .unwrap()
                .arc()
                .clone()
        })
        .collect();
    (kernel, objs)
}

fn bench_bitmap(c: &mut Criterion) {
    let mut group = c.benchmark_group("prio_bitmap");
    for prio in [1usize, 63, 64, 200, 255] {
        group.bench_with_input(BenchmarkId::new("highest", prio), &prio, |b, &prio| {
            let mut bm = PrioBitmap::default();
            bm.set(prio);
            bm.set(0);
            b.iter(|| black_box(&bm).highest());
        });
    }
    group.finish();
}

fn bench_enqueue_pop(c: &mut Criterion) {
    let mut group = c.benchmark_group("ready_queue");
    for count in [8usize, 64, 256] {
        let (_kernel, objs) = objects(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("enqueue_pop", count), &objs, |b, objs| {
            let mut rq = ReadyQueue::new();
            b.iter(|| {
                for (i, obj) in objs.iter().enumerate() {
                    rq.enqueue(obj.clone(), 1 + i % 255);
                }
                while let Some(entry) = rq.pop_highest() {
                    black_box(entry);
                }
            });
        });
        group.bench_with_input(BenchmarkId::new("remove_middle", count), &objs, |b, objs| {
            let mut rq = ReadyQueue::new();
            for obj in objs {
                rq.enqueue(obj.clone(), 10);
            }
            let victim = &objs[objs.len() / 2];
            b.iter(|| {
                rq.remove(black_box(victim));
                rq.enqueue(victim.clone(), 10);
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_bitmap, bench_enqueue_pop);
criterion_main!(benches);
