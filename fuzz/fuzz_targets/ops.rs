#![no_main]

use libfuzzer_sys::{fuzz_mutator, fuzz_target, fuzzer_mutate};
use mutatis::Session;
use page_fragmenter_fuzzing::Ops;

const fn bincode_config() -> impl bincode::config::Config {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

fuzz_mutator!(|data: &mut [u8], size: usize, max_size: usize, seed: u32| {
    let _ = env_logger::try_init();

    // With probability of about 1/8, just use the default mutator.
    if seed.count_ones() % 8 == 0 {
        return fuzzer_mutate(data, size, max_size);
    }

    // Decode the ops from the data, or start over from no ops.
    let mut ops = bincode::decode_from_slice::<Ops, _>(&data[..size], bincode_config())
        .map_or_else(|_decode_err| Ops::default(), |(ops, _)| ops);

    let mut session = Session::new().seed(seed.into()).shrink(max_size < size);

    if session.mutate(&mut ops).is_ok() {
        // Re-encode the mutated ops, dropping trailing ops until they fit.
        loop {
            if let Ok(new_size) =
                bincode::encode_into_slice(&ops, &mut data[..max_size], bincode_config())
            {
                return new_size;
            }
            if !ops.pop() {
                break;
            }
        }
    }

    fuzzer_mutate(data, size, max_size)
});

fuzz_target!(|data: &[u8]| {
    let _ = env_logger::try_init();
    if let Ok((ops, _)) = bincode::decode_from_slice::<Ops, _>(data, bincode_config()) {
        if let Err(e) = ops.run() {
            panic!("error: {e}");
        }
    }
});
