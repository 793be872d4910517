#![forbid(unsafe_code)]
//! Shared fixtures for the ForkFS end-to-end tests.

use forkfs_core::{ForkFs, ForkFsOptions};
use forkfs_ondisk::base::BaseImageBuilder;
use forkfs_ondisk::format::{FormatOptions, format_image};
use forkfs_window::MemWindow;
use std::sync::Arc;

/// Contents of `/hello.txt` in the standard fixture image.
pub const HELLO: &[u8] = b"Hello from base image";

/// Base image with `/hello.txt` and `/subdir/nested.txt`.
#[must_use]
pub fn base_fixture() -> Vec<u8> {
    let mut builder = BaseImageBuilder::new();
    let root = builder.root();
    builder
        .add_file(root, "hello.txt", 0o644, HELLO)
        .expect("hello.txt");
    let subdir = builder.add_dir(root, "subdir", 0o755).expect("subdir");
    builder
        .add_file(subdir, "nested.txt", 0o644, b"nested contents")
        .expect("nested.txt");
    builder.build().expect("base image")
}

/// Open an in-memory filesystem seeded with [`base_fixture`].
#[must_use]
pub fn fixture_fs() -> ForkFs {
    let window = Arc::new(MemWindow::zeroed(16 * 1024 * 1024));
    format_image(
        window.as_ref(),
        &FormatOptions {
            base_image: Some(base_fixture()),
            main_log_capacity: 1024 * 1024,
        },
    )
    .expect("format");
    ForkFs::open(
        window,
        ForkFsOptions {
            branch_capacity: 128 * 1024,
        },
    )
    .expect("open")
}

/// Open an in-memory filesystem with no base image.
#[must_use]
pub fn empty_fs() -> ForkFs {
    let window = Arc::new(MemWindow::zeroed(8 * 1024 * 1024));
    format_image(
        window.as_ref(),
        &FormatOptions {
            base_image: None,
            main_log_capacity: 512 * 1024,
        },
    )
    .expect("format");
    ForkFs::open(
        window,
        ForkFsOptions {
            branch_capacity: 128 * 1024,
        },
    )
    .expect("open")
}
