use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;

use corowait::{block_on, co_poll, PollFd};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

// Every fd is already readable before the coroutine starts polling, so this measures
// the reactor's per-fd register/epoll_wait/dispatch overhead at increasing fan-out
// rather than actual blocking latency.
fn fanout(n: usize) {
    let pairs: Vec<(UnixStream, UnixStream)> = (0..n)
        .map(|_| {
            let (a, b) = UnixStream::pair().unwrap();
            a.set_nonblocking(true).unwrap();
            (a, b)
        })
        .collect();

    block_on(move || {
        for (_, w) in pairs.iter() {
            w.write_all(b"x").unwrap();
        }
        for (r, _) in pairs.iter() {
            let mut entry = [PollFd::new(r.as_raw_fd(), libc::POLLIN as u16)];
            let ready = co_poll(&mut entry, 1_000);
            assert_eq!(ready, 1);
        }
    });
}

fn bench_co_poll_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("corowait");
    for n in [1usize, 100, 1_000] {
        group.bench_function(format!("co_poll_fanout_{n}"), |b| {
            b.iter(|| fanout(black_box(n)));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_co_poll_fanout);
criterion_main!(benches);
