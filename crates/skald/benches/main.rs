use criterion::{Criterion, black_box, criterion_group, criterion_main};
use skald::{NoPrint, Vm, VmConfig, compile};

const FIB: &str = "fn fib(n) if n <= 1 then return n end return fib(n-1) + fib(n-2) end fib(18)";

const STRING_CHURN: &str = "
    let keep = []
    for i in 1 to 200 do
        push(keep, \"keep-\" + str(i))
    end
    for i in 1 to 5000 do
        let s = \"junk-\" + str(i)
    end
    len(keep)
";

const DICT_WORKLOAD: &str = "
    let d = {}
    for i in 1 to 2000 do
        d[str(i)] = i
    end
    let total = 0
    for k in d do
        total = total + d[k]
    end
    total
";

fn bench_compile(c: &mut Criterion) {
    c.bench_function("compile_fib", |b| {
        b.iter(|| compile(black_box(FIB), "bench").expect("compiles"));
    });
}

fn bench_fib(c: &mut Criterion) {
    let program = compile(FIB, "bench").expect("compiles");
    c.bench_function("run_fib_18", |b| {
        let mut vm = Vm::with_writer(VmConfig::default(), NoPrint);
        b.iter(|| vm.run(black_box(&program)).expect("runs"));
    });
}

fn bench_string_churn(c: &mut Criterion) {
    let program = compile(STRING_CHURN, "bench").expect("compiles");
    c.bench_function("run_string_churn", |b| {
        let mut vm = Vm::with_writer(VmConfig::default(), NoPrint);
        b.iter(|| vm.run(black_box(&program)).expect("runs"));
    });
}

fn bench_dicts(c: &mut Criterion) {
    let program = compile(DICT_WORKLOAD, "bench").expect("compiles");
    c.bench_function("run_dict_workload", |b| {
        let mut vm = Vm::with_writer(VmConfig::default(), NoPrint);
        b.iter(|| vm.run(black_box(&program)).expect("runs"));
    });
}

criterion_group!(benches, bench_compile, bench_fib, bench_string_churn, bench_dicts);
criterion_main!(benches);
