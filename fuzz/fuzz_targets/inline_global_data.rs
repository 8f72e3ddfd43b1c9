#![no_main]

use libfuzzer_sys::fuzz_target;

use bpf_collection::{
    inline::{inline, GLOBAL_DATA_TABLE},
    instruction::Instruction,
    program::{ProgramSpec, ProgramType},
    table::TableSpec,
    CollectionSpec, Endianness,
};

#[derive(arbitrary::Arbitrary, Debug)]
struct FuzzData {
    value: Vec<u8>,
    big_endian: bool,
    instructions: Vec<Instruction>,
}

fuzz_target!(|data: FuzzData| {
    let byte_order = if data.big_endian {
        Endianness::Big
    } else {
        Endianness::Little
    };
    let mut spec = CollectionSpec::new()
        .with_table(TableSpec::global_data(GLOBAL_DATA_TABLE, data.value))
        .with_program(ProgramSpec::new(
            "fuzz",
            ProgramType::SocketFilter,
            "GPL",
            data.instructions,
        ))
        .with_byte_order(byte_order);
    let pristine = spec.clone();
    match inline(&mut spec) {
        Ok(_) => {
            let once = spec.clone();
            assert_eq!(inline(&mut spec).map(|summary| summary.inlined), Ok(0));
            assert_eq!(spec, once);
            assert_eq!(
                spec.programs["fuzz"].instructions.len(),
                pristine.programs["fuzz"].instructions.len()
            );
        }
        Err(_) => assert_eq!(spec, pristine),
    }
});
