#![forbid(unsafe_code)]
//! End-to-end scenarios over the public ForkFS API.

use forkfs_error::ForkFsError;
use forkfs_harness::{HELLO, fixture_fs};
use forkfs_ondisk::MAIN_BRANCH;
use forkfs_types::InodeNumber;

#[test]
fn base_image_is_read_only_through_main() {
    let fs = fixture_fs();
    let mount = fs.mount_main_read_only().expect("mount main");

    let ino = fs
        .lookup(mount, InodeNumber::ROOT, b"hello.txt")
        .expect("lookup")
        .expect("hello.txt resolves");
    let data = fs.read(mount, ino, 0, 64).expect("read");
    assert_eq!(data.len(), 21);
    assert_eq!(data, HELLO);

    assert!(matches!(
        fs.write(mount, ino, 0, b"nope"),
        Err(ForkFsError::ReadOnly)
    ));
    assert!(matches!(
        fs.unlink(mount, InodeNumber::ROOT, b"hello.txt"),
        Err(ForkFsError::ReadOnly)
    ));
}

#[test]
fn branch_writes_are_invisible_to_siblings() {
    let fs = fixture_fs();
    fs.create_branch("b1", MAIN_BRANCH).expect("b1");
    fs.create_branch("b2", MAIN_BRANCH).expect("b2");
    let m1 = fs.mount("b1").expect("mount b1");
    let m2 = fs.mount("b2").expect("mount b2");

    let ino = fs
        .create(m1, InodeNumber::ROOT, b"a.txt", 0o644)
        .expect("create");
    fs.write(m1, ino, 0, b"X").expect("write");

    assert_eq!(
        fs.lookup(m2, InodeNumber::ROOT, b"a.txt").expect("lookup"),
        None
    );
    assert!(matches!(
        fs.getattr(m2, ino),
        Err(ForkFsError::NotFound(_))
    ));
}

#[test]
fn delete_shadows_base_without_touching_ancestors() {
    let fs = fixture_fs();
    fs.create_branch("scratch", MAIN_BRANCH).expect("branch");
    let branch = fs.mount("scratch").expect("mount");
    let main = fs.mount_main_read_only().expect("main");

    let subdir = fs
        .lookup(branch, InodeNumber::ROOT, b"subdir")
        .expect("lookup")
        .expect("subdir");
    fs.unlink(branch, subdir, b"nested.txt").expect("unlink");

    assert_eq!(
        fs.lookup(branch, subdir, b"nested.txt").expect("lookup"),
        None
    );
    // The tombstone lives only in the branch; main still resolves it.
    let surviving = fs
        .lookup(main, subdir, b"nested.txt")
        .expect("lookup")
        .expect("still present in main");
    let attr = fs.getattr(main, surviving).expect("getattr");
    assert_eq!(attr.size, 15);
}

#[test]
fn rename_keeps_the_inode() {
    let fs = fixture_fs();
    fs.create_branch("mv", MAIN_BRANCH).expect("branch");
    let mount = fs.mount("mv").expect("mount");

    let foo = fs
        .create(mount, InodeNumber::ROOT, b"foo", 0o644)
        .expect("create foo");
    fs.rename(mount, InodeNumber::ROOT, b"foo", InodeNumber::ROOT, b"bar", 0)
        .expect("rename");

    assert_eq!(fs.lookup(mount, InodeNumber::ROOT, b"foo").expect("old"), None);
    assert_eq!(
        fs.lookup(mount, InodeNumber::ROOT, b"bar").expect("new"),
        Some(foo)
    );
}

#[test]
fn later_write_wins_on_overlap() {
    let fs = fixture_fs();
    fs.create_branch("w", MAIN_BRANCH).expect("branch");
    let mount = fs.mount("w").expect("mount");

    let ino = fs
        .create(mount, InodeNumber::ROOT, b"o.txt", 0o644)
        .expect("create");
    fs.write(mount, ino, 0, b"AAAA").expect("write 1");
    fs.write(mount, ino, 2, b"BB").expect("write 2");

    assert_eq!(fs.read(mount, ino, 0, 4).expect("read"), b"AABB");
}

#[test]
fn commit_merges_and_invalidates_siblings() {
    let fs = fixture_fs();
    fs.create_branch("b1", MAIN_BRANCH).expect("b1");
    fs.create_branch("b2", MAIN_BRANCH).expect("b2");
    let m1 = fs.mount("b1").expect("mount b1");
    let m2 = fs.mount("b2").expect("mount b2");

    let x = fs
        .create(m1, InodeNumber::ROOT, b"x", 0o644)
        .expect("create /x");
    fs.write(m1, x, 0, b"payload").expect("write /x");
    fs.commit("b1").expect("commit b1");

    // A new mount of main sees /x with its data.
    let main = fs.mount_main_read_only().expect("mount main");
    assert_eq!(
        fs.lookup(main, InodeNumber::ROOT, b"x").expect("lookup"),
        Some(x)
    );
    assert_eq!(fs.read(main, x, 0, 16).expect("read"), b"payload");

    // Every operation on the sibling mount fails with Stale.
    assert!(matches!(
        fs.lookup(m2, InodeNumber::ROOT, b"x"),
        Err(ForkFsError::Stale)
    ));
    assert!(matches!(fs.getattr(m2, x), Err(ForkFsError::Stale)));
    assert!(matches!(fs.read(m2, x, 0, 1), Err(ForkFsError::Stale)));
    assert!(matches!(
        fs.write(m2, x, 0, b"y"),
        Err(ForkFsError::Stale)
    ));
    assert!(matches!(
        fs.iterate(m2, InodeNumber::ROOT, 0),
        Err(ForkFsError::Stale)
    ));
    // The already-mounted m1 leaf is COMMITTED now, so it is stale too.
    assert!(matches!(
        fs.lookup(m1, InodeNumber::ROOT, b"x"),
        Err(ForkFsError::Stale)
    ));
}

#[test]
fn nested_branches_resolve_through_the_chain() {
    let fs = fixture_fs();
    fs.create_branch("child", MAIN_BRANCH).expect("child");
    fs.create_branch("grandchild", "child").expect("grandchild");

    let child = fs.mount("child").expect("mount child");
    let hello = fs
        .lookup(child, InodeNumber::ROOT, b"hello.txt")
        .expect("lookup")
        .expect("hello");
    fs.write(child, hello, 0, b"Howdy").expect("write in child");

    let grandchild = fs.mount("grandchild").expect("mount grandchild");
    // The grandchild sees the base file... but not the child's write,
    // because the grandchild forked from child after nothing: chain is
    // grandchild -> child -> main, so the child's write IS visible.
    assert_eq!(
        fs.read(grandchild, hello, 0, 10).expect("read"),
        b"Howdy from"
    );

    // A write in the grandchild shadows both.
    fs.write(grandchild, hello, 0, b"Yo").expect("write");
    assert_eq!(
        fs.read(grandchild, hello, 0, 10).expect("read"),
        b"Yowdy from"
    );
    assert_eq!(fs.read(child, hello, 0, 10).expect("read"), b"Howdy from");
}

#[test]
fn iterate_lists_dots_base_and_branch_entries() {
    let fs = fixture_fs();
    fs.create_branch("ls", MAIN_BRANCH).expect("branch");
    let mount = fs.mount("ls").expect("mount");
    fs.create(mount, InodeNumber::ROOT, b"added.txt", 0o644)
        .expect("create");

    let names: Vec<Vec<u8>> = fs
        .iterate(mount, InodeNumber::ROOT, 0)
        .expect("iterate")
        .into_iter()
        .map(|e| e.name)
        .collect();
    assert_eq!(&names[..2], &[b".".to_vec(), b"..".to_vec()]);
    assert!(names.contains(&b"hello.txt".to_vec()));
    assert!(names.contains(&b"subdir".to_vec()));
    assert!(names.contains(&b"added.txt".to_vec()));
    assert_eq!(names.len(), 5);
}

#[test]
fn unmounting_a_stale_sibling_releases_it() {
    let fs = fixture_fs();
    fs.create_branch("b1", MAIN_BRANCH).expect("b1");
    fs.create_branch("b2", MAIN_BRANCH).expect("b2");
    let m2 = fs.mount("b2").expect("mount b2");
    fs.commit("b1").expect("commit");

    assert!(matches!(
        fs.lookup(m2, InodeNumber::ROOT, b"hello.txt"),
        Err(ForkFsError::Stale)
    ));
    fs.unmount(m2).expect("unmount");
    fs.abort("b2").expect("abort stale branch");
    assert!(!fs.branches_info().iter().any(|b| b.name == "b2"));
}
