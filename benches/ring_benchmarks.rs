//! Performance benchmarks for the display pipeline
//!
//! Covers the hot path of a repaint: building drawables, pushing them
//! through the command ring and handing them to the server.

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use qxl_bridge::qxl::{ReleaseInfoExt, MEMSLOT_GROUP};
use qxl_bridge::{
    Damage, DisplayConfig, DisplayContext, FrameBuffer, ServerCallbacks, SurfaceBacking,
};

fn display_with_surface(ring_capacity: usize) -> (DisplayContext, qxl_bridge::SurfaceId) {
    let config = DisplayConfig {
        ring_capacity,
        ..DisplayConfig::default()
    };
    let mut display = DisplayContext::new(&config).unwrap();
    let surface = display
        .surfaces_mut()
        .create_primary_surface(256, 256, SurfaceBacking::allocate(256, 256).unwrap())
        .unwrap();
    display.ring().drain();
    (display, surface)
}

/// Enqueue and dequeue through rings of different sizes
fn bench_ring_throughput(c: &mut Criterion) {
    let mut group = c.benchmark_group("ring_throughput");

    for capacity in [16usize, 256, 1024].iter() {
        group.bench_with_input(
            format!("fill_and_drain_{}", capacity),
            capacity,
            |b, &capacity| {
                b.iter_batched(
                    || {
                        let (mut display, surface) = display_with_surface(capacity);
                        let commands: Vec<_> = (0..capacity)
                            .map(|i| {
                                display
                                    .builder_mut()
                                    .build_fill(surface, 0xff00_00ff, (i % 256) as i32, 0, 1, 1)
                                    .unwrap()
                            })
                            .collect();
                        (display, commands)
                    },
                    |(display, commands)| {
                        let ring = display.ring();
                        for command in commands {
                            let _ = ring.try_enqueue(command);
                        }
                        while let Some(command) = ring.dequeue() {
                            black_box(command.release_id());
                        }
                    },
                    BatchSize::SmallInput,
                );
            },
        );
    }

    group.finish();
}

/// Build an image blit from a rendered frame
fn bench_image_blit(c: &mut Criterion) {
    let mut group = c.benchmark_group("image_blit");

    for size in [64u32, 256].iter() {
        group.bench_with_input(format!("blit_{}x{}", size, size), size, |b, &size| {
            let (mut display, surface) = display_with_surface(1024);
            let frame = FrameBuffer::new(256, 256).unwrap();
            let damage = Damage::full(size, size);
            let region = damage.extents().unwrap();

            b.iter(|| {
                let view = frame.view(&region).unwrap();
                let stride = view.stride();
                let command = display
                    .builder_mut()
                    .build_image_blit(surface, 0, 0, size, size, view, stride, &damage)
                    .unwrap();
                black_box(command.image_id());
            });
        });
    }

    group.finish();
}

/// Server round trip: get_command then release_resource
fn bench_server_round_trip(c: &mut Criterion) {
    c.bench_function("get_command_and_release", |b| {
        let (mut display, surface) = display_with_surface(1024);
        let facade = display.server_facade();

        b.iter(|| {
            let command = display
                .builder_mut()
                .build_fill(surface, 0, 0, 0, 8, 8)
                .unwrap();
            display.ring().try_enqueue(command).ok();
            let dispatched = facade.get_command().unwrap().unwrap();
            let notice = facade
                .release_resource(ReleaseInfoExt {
                    id: dispatched.release_id.0,
                    group_id: MEMSLOT_GROUP,
                })
                .unwrap();
            black_box(notice);
        });
    });
}

criterion_group!(
    benches,
    bench_ring_throughput,
    bench_image_blit,
    bench_server_round_trip,
);

criterion_main!(benches);
