use std::sync::{Arc, Mutex};

use criterion::{black_box, BatchSize, BenchmarkId, Criterion};
use criterion::{criterion_group, criterion_main};

use courier::queue::{Consumer, HandleStatus, MessageReference};
use courier::{Message, Result, ServerContext, Transaction};

const MESSAGES_PER_ITER: usize = 5_000;

struct Collect(Mutex<Vec<Arc<MessageReference>>>);

impl Consumer for Collect {
    fn handle(&self, reference: &Arc<MessageReference>) -> Result<HandleStatus> {
        self.0.lock().expect("consumer lock").push(Arc::clone(reference));
        Ok(HandleStatus::Handled)
    }
}

fn bench_deliver(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_delivery");
    for &consumers in &[1_usize, 4] {
        group.bench_with_input(
            BenchmarkId::new("send_deliver_ack", consumers),
            &consumers,
            |b, &consumers| {
                b.iter_batched(
                    || {
                        let context = ServerContext::builder().build().expect("context");
                        let queue = context
                            .create_queue("bench", "bench.q", None, false, false)
                            .expect("queue");
                        let sinks: Vec<Arc<Collect>> = (0..consumers)
                            .map(|_| Arc::new(Collect(Mutex::new(Vec::new()))))
                            .collect();
                        for sink in &sinks {
                            queue.add_consumer(sink.clone()).expect("consumer");
                        }
                        (context, queue, sinks)
                    },
                    |(context, queue, sinks)| {
                        for n in 0..MESSAGES_PER_ITER {
                            let mut tx = Transaction::new(&context).expect("tx");
                            tx.add_message(Message::new("bench", black_box(vec![0u8; 64])).priority((n % 10) as u8))
                                .expect("send");
                            tx.commit().expect("commit");
                        }
                        for sink in &sinks {
                            for reference in sink.0.lock().expect("consumer lock").drain(..) {
                                queue.acknowledge(&reference).expect("ack");
                            }
                        }
                    },
                    BatchSize::LargeInput,
                );
            },
        );
    }
    group.finish();
}

fn bench_priority_drain(c: &mut Criterion) {
    c.bench_function("queue_priority_drain", |b| {
        b.iter_batched(
            || {
                let context = ServerContext::builder().build().expect("context");
                let queue = context
                    .create_queue("bench", "bench.q", None, false, false)
                    .expect("queue");
                let mut tx = Transaction::new(&context).expect("tx");
                for n in 0..MESSAGES_PER_ITER {
                    tx.add_message(Message::new("bench", "x").priority((n % 10) as u8))
                        .expect("send");
                }
                tx.commit().expect("commit");
                (context, queue)
            },
            |(_context, queue)| {
                while let Some(reference) = queue.remove_first().expect("remove") {
                    black_box(reference.message_id());
                }
            },
            BatchSize::LargeInput,
        );
    });
}

criterion_group!(benches, bench_deliver, bench_priority_drain);
criterion_main!(benches);
