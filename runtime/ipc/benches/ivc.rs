use std::hint::black_box;
use std::sync::Arc;

use criterion::{criterion_group, criterion_main, Criterion};
use dce_ipc::{Geometry, IvcChannel, LogTraceSink, SharedRegion, Side, TraceSink};

fn make_pair(geometry: Geometry) -> (IvcChannel, IvcChannel) {
    let region = SharedRegion::new(0x8000_0000, geometry.region_size());
    let sink: Arc<dyn TraceSink> = Arc::new(LogTraceSink);
    let mut host = IvcChannel::new(0, region.clone(), geometry, Side::Host, None, sink.clone())
        .expect("host end");
    let mut remote =
        IvcChannel::new(0, region, geometry, Side::Remote, None, sink).expect("remote end");

    host.init();
    remote.init();
    host.reset();
    while !(host.is_established() && remote.is_established()) {
        remote.notified();
        host.notified();
    }
    (host, remote)
}

fn bench_frame_round_trip(c: &mut Criterion) {
    let (mut host, mut remote) = make_pair(Geometry::new(16, 256));
    let payload = [0xa5u8; 200];

    c.bench_function("ivc_frame_round_trip", |b| {
        b.iter(|| {
            host.write_frame(black_box(&payload)).expect("write");
            black_box(remote.read_frame().expect("read"));
        });
    });
}

fn bench_fill_and_drain(c: &mut Criterion) {
    let geometry = Geometry::new(64, 64);
    let (mut host, mut remote) = make_pair(geometry);

    c.bench_function("ivc_fill_and_drain_64", |b| {
        b.iter(|| {
            for i in 0..geometry.nframes {
                host.write_frame(&i.to_le_bytes()).expect("write");
            }
            while remote.can_read() {
                black_box(remote.read_frame().expect("read"));
            }
        });
    });
}

criterion_group!(benches, bench_frame_round_trip, bench_fill_and_drain);
criterion_main!(benches);
