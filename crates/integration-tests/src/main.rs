//! Integration tests for shk
//!
//! Runs the built binary end-to-end against a temporary keystore and a stub
//! Dropbear toolchain. Build `shk` first and point `SHK_PATH` at it (the
//! workspace target directory is probed as a fallback).

use libtest_mimic::{Arguments, Trial};

mod tests {
    pub mod activation;
    pub mod keystore;
}

fn main() {
    let args = Arguments::from_args();

    let tests = vec![
        Trial::test("keystore_cold_start", tests::keystore::cold_start),
        Trial::test(
            "keystore_idempotent_regenerate",
            tests::keystore::idempotent_regenerate,
        ),
        Trial::test(
            "keystore_forced_regenerate",
            tests::keystore::forced_regenerate,
        ),
        Trial::test(
            "keystore_check_exit_codes",
            tests::keystore::check_exit_codes,
        ),
        Trial::test(
            "activation_rejects_invalid_state",
            tests::activation::rejects_invalid_state,
        ),
        Trial::test(
            "activation_requires_environment",
            tests::activation::requires_environment,
        ),
        Trial::test(
            "activation_rejects_invalid_home",
            tests::activation::rejects_invalid_home,
        ),
    ];

    libtest_mimic::run(&args, tests).exit();
}
