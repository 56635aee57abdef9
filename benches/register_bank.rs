//! Register bank throughput: bulk reads and writes at the protocol maxima

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use voltage_modbus_slave::{ModbusRegisterBank, MAX_REGISTERS_PER_REQUEST, MAX_WRITE_COILS_PER_REQUEST};

fn bench_registers(c: &mut Criterion) {
    let bank = ModbusRegisterBank::with_counts(65536, 65536, 65536, 65536).unwrap();
    let mut group = c.benchmark_group("holding_registers");

    for count in [1u16, 16, MAX_REGISTERS_PER_REQUEST] {
        let values = vec![0xABCD; count as usize];
        group.bench_with_input(BenchmarkId::new("write", count), &values, |b, values| {
            b.iter(|| bank.write_holding_registers(black_box(1000), values).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("read", count), &count, |b, &count| {
            b.iter(|| bank.read_holding_registers(black_box(1000), count).unwrap())
        });
    }
    group.finish();
}

fn bench_coils(c: &mut Criterion) {
    let bank = ModbusRegisterBank::with_counts(65536, 0, 0, 0).unwrap();
    let values = vec![true; MAX_WRITE_COILS_PER_REQUEST as usize];

    c.bench_function("coils/write_max", |b| {
        b.iter(|| bank.write_coils(black_box(0), &values).unwrap())
    });
    c.bench_function("coils/read_max", |b| {
        b.iter(|| bank.read_coils(black_box(0), MAX_WRITE_COILS_PER_REQUEST).unwrap())
    });
}

criterion_group!(benches, bench_registers, bench_coils);
criterion_main!(benches);
