use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use luavm::{Dynamic, StatePool, VirtualMachine, VmOptions};
use mlua::{Lua, LuaOptions};

fn bench_instances(c: &mut Criterion) {
    let pool = StatePool::with_defaults();
    let opts = VmOptions::default();

    let mut g = c.benchmark_group("instance_acquire");

    g.bench_function("fresh_lua_state", |b| {
        b.iter(|| black_box(Lua::new_with(opts.stdlib, LuaOptions::new()).unwrap()))
    });
    g.bench_function("pool_borrow_return", |b| {
        b.iter(|| {
            let inst = pool.borrow().unwrap();
            pool.give_back(black_box(inst));
        })
    });

    g.finish();
}

fn bench_sessions(c: &mut Criterion) {
    let pool = Arc::new(StatePool::with_defaults());

    let mut g = c.benchmark_group("session");

    g.bench_function("open_execute_close", |b| {
        b.iter(|| {
            let mut vm = VirtualMachine::with_pool(Arc::clone(&pool)).unwrap();
            vm.execute_string("t = {10, 20, 30}").unwrap();
            black_box(vm.get_global("t").unwrap());
            vm.close();
        })
    });

    let mut vm = VirtualMachine::with_pool(Arc::clone(&pool)).unwrap();
    vm.execute_string("function sum(xs) local s = 0 for _, v in ipairs(xs) do s = s + v end return s end")
        .unwrap();
    let xs: Dynamic = (0..100).map(Dynamic::Int).collect();
    g.bench_function("call_function_marshal_100", |b| {
        b.iter(|| black_box(vm.call_function("sum", std::slice::from_ref(&xs)).unwrap()))
    });

    g.finish();
}

criterion_group!(benches, bench_instances, bench_sessions);
criterion_main!(benches);
