#![feature(test)]

extern crate bpf_collection;
extern crate test;
extern crate test_utils;

use bpf_collection::{
    inline::{inline, GLOBAL_DATA_TABLE},
    table::TableSpec,
    CollectionSpec,
};
use test::Bencher;
use test_utils::{global_data_reader, MockKernel};

fn global_data_spec(programs: usize, loads: u32) -> CollectionSpec {
    let value: Vec<u8> = (0..loads * 4).map(|byte| byte as u8).collect();
    let offsets: Vec<u32> = (0..loads).map(|load| load * 4).collect();
    let mut spec =
        CollectionSpec::new().with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, value));
    for program in 0..programs {
        spec = spec.with_program(global_data_reader(
            &format!("reader_{}", program),
            GLOBAL_DATA_TABLE,
            &offsets,
        ));
    }
    spec
}

#[bench]
fn bench_inline_single_program(bencher: &mut Bencher) {
    let spec = global_data_spec(1, 1024);
    bencher.iter(|| {
        let mut spec = spec.clone();
        inline(&mut spec).unwrap()
    });
}

#[bench]
fn bench_inline_many_programs(bencher: &mut Bencher) {
    let spec = global_data_spec(64, 16);
    bencher.iter(|| {
        let mut spec = spec.clone();
        inline(&mut spec).unwrap()
    });
}

#[bench]
fn bench_load_collection(bencher: &mut Bencher) {
    let spec = global_data_spec(16, 64);
    bencher.iter(|| {
        let kernel = MockKernel::new();
        bpf_collection::load_collection(&kernel, &spec, Default::default()).unwrap()
    });
}
