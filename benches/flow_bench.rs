use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kvstream::flow::{duplex, queue, Source};
use kvstream::{KvStore, KvsEngine, RangeOptions, Record, StreamIterator};
use tempfile::TempDir;

fn queue_write_then_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue");
    for count in [16_u64, 256, 4096] {
        group.bench_with_input(BenchmarkId::new("write_then_read", count), &count, |b, &count| {
            b.iter(|| {
                let (mut producer, mut consumer) = queue::<u64>();
                for i in 0..count {
                    producer.write(i);
                }
                producer.finish();
                while let Ok(Some(v)) = consumer.read().wait() {
                    black_box(v);
                }
            })
        });
    }
    group.finish();
}

fn duplex_through_iterator(c: &mut Criterion) {
    c.bench_function("duplex_through_iterator_1k", |b| {
        b.iter(|| {
            let (mut writer, reader) = duplex();
            for i in 0..1000 {
                writer
                    .write(Record::new(format!("k{:04}", i), "value"))
                    .unwrap();
            }
            writer.end();
            let it = StreamIterator::from_source(reader, true, true);
            black_box(it.entries().count())
        })
    });

    c.bench_function("duplex_drain_1k", |b| {
        b.iter(|| {
            let (mut writer, reader) = duplex::<u32>();
            for i in 0..1000 {
                writer.write(i).unwrap();
            }
            writer.end();
            black_box(reader.drain().count())
        })
    });
}

fn local_range(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let store = KvStore::open(dir.path()).unwrap();
    for i in 0..1000 {
        store.put(format!("key{:04}", i), "value".to_owned()).unwrap();
    }
    c.bench_function("kvstore_iterator_1k", |b| {
        b.iter(|| {
            let it = store.iterator(RangeOptions::all()).unwrap();
            black_box(it.entries().count())
        })
    });
}

criterion_group!(benches, queue_write_then_read, duplex_through_iterator, local_range);
criterion_main!(benches);
