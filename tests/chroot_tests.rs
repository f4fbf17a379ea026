//! Chroot session lifecycle tests, driven through a recording mounter.

mod helpers;

use std::fs;
use std::path::PathBuf;

use helpers::{EntryFixture, FakeMounter, GptFixture, MountEvent, TestEnv};
use imgcraft::chroot::image::root_device;
use imgcraft::chroot::lock::LOCK_FILE;
use imgcraft::chroot::arch::host_arch;
use imgcraft::chroot::{
    run_in_chroot, save_root, BindMountSpec, ChrootOptions, ChrootSession, ReleaseStep,
    SessionState,
};
use imgcraft::error::Error;

/// Bind specs for two host directories at /mnt/a and /mnt/b.
fn two_binds(env: &TestEnv) -> Vec<BindMountSpec> {
    vec![
        BindMountSpec::new(env.host_dir("a"), Some(PathBuf::from("/mnt/a"))),
        BindMountSpec::new(env.host_dir("b"), Some(PathBuf::from("/mnt/b"))),
    ]
}

/// Options binding host dirs `a` and `b` at /mnt/a and /mnt/b, with no
/// system binds and no architecture probing.
fn explicit_binds(env: &TestEnv) -> ChrootOptions {
    ChrootOptions {
        binds: vec![
            format!("{}:/mnt/a", env.host_dir("a").display()),
            format!("{}:/mnt/b", env.host_dir("b").display()),
        ],
        command: vec!["/bin/true".to_string()],
        no_default_binds: true,
        arch: Some(host_arch().unwrap()),
        ..ChrootOptions::default()
    }
}

#[test]
fn test_second_session_on_same_root_is_locked_out() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut first = ChrootSession::new(&env.root, &mounter);
    first.acquire_lock().unwrap();
    assert_eq!(first.state(), SessionState::Locked);

    let mut second = ChrootSession::new(&env.root, &mounter);
    match second.acquire_lock() {
        Err(Error::Lock { path }) => assert_eq!(path, env.root.join(LOCK_FILE)),
        other => panic!("expected lock error, got {:?}", other),
    }
    assert_eq!(second.state(), SessionState::Idle);
}

#[test]
fn test_lock_reacquired_after_teardown() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut first = ChrootSession::new(&env.root, &mounter);
    first.acquire_lock().unwrap();
    assert!(first.teardown().is_empty());
    assert_eq!(first.state(), SessionState::TornDown);
    assert!(!env.root.join(LOCK_FILE).exists());

    let mut second = ChrootSession::new(&env.root, &mounter);
    second.acquire_lock().unwrap();
}

#[test]
fn test_pending_release_is_reverse_acquisition_order() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut session = ChrootSession::new(&env.root, &mounter);
    session.acquire_lock().unwrap();
    session.mount_binds(two_binds(&env)).unwrap();
    assert_eq!(session.state(), SessionState::Mounted);

    assert_eq!(
        session.pending_release(),
        vec![
            ReleaseStep::Unbind(env.root.join("mnt/b")),
            ReleaseStep::Unbind(env.root.join("mnt/a")),
            ReleaseStep::SweepMounts,
            ReleaseStep::ReleaseLock,
        ]
    );
}

#[test]
fn test_unmounts_mirror_binds() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut session = ChrootSession::new(&env.root, &mounter);
    session.acquire_lock().unwrap();
    session.mount_binds(two_binds(&env)).unwrap();
    assert!(session.mounts().iter().all(|m| m.mounted));
    assert!(session.teardown().is_empty());

    let a = env.root.join("mnt/a");
    let b = env.root.join("mnt/b");
    assert_eq!(
        mounter.events(),
        vec![
            MountEvent::Bind(a.clone()),
            MountEvent::Bind(b.clone()),
            MountEvent::Unmount {
                target: b,
                lazy: true
            },
            MountEvent::Unmount {
                target: a,
                lazy: true
            },
        ]
    );
    assert!(session.mounts().iter().all(|m| !m.mounted));
    assert!(mounter.live().is_empty());
}

#[test]
fn test_lock_released_last() {
    let env = TestEnv::new();
    let lock = env.root.join(LOCK_FILE);
    let mounter = FakeMounter::watching(lock.clone());

    let mut session = ChrootSession::new(&env.root, &mounter);
    session.acquire_lock().unwrap();
    session.mount_binds(two_binds(&env)).unwrap();
    session.teardown();

    let hits = mounter.sightings.borrow().clone();
    assert_eq!(hits, vec![true, true]);
    assert!(!lock.exists());
}

#[test]
fn test_drop_tears_down() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    {
        let mut session = ChrootSession::new(&env.root, &mounter);
        session.acquire_lock().unwrap();
        session.mount_binds(two_binds(&env)).unwrap();
    }

    assert_eq!(mounter.unmounted().len(), 2);
    assert!(!env.root.join(LOCK_FILE).exists());
}

#[test]
fn test_teardown_runs_once() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut session = ChrootSession::new(&env.root, &mounter);
    session.acquire_lock().unwrap();
    session.mount_binds(two_binds(&env)).unwrap();
    session.teardown();
    let events = mounter.events().len();

    assert!(session.teardown().is_empty());
    drop(session);
    assert_eq!(mounter.events().len(), events);
}

#[test]
fn test_sweep_leaves_preexisting_mounts() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();
    let before = env.root.join("srv");
    fs::create_dir_all(&before).unwrap();
    mounter.add_live(before.clone());

    let mut session = ChrootSession::new(&env.root, &mounter);
    session.acquire_lock().unwrap();

    // Mounted by something running inside the root.
    let stray = env.root.join("run/stray");
    fs::create_dir_all(&stray).unwrap();
    mounter.add_live(stray.clone());

    assert!(session.teardown().is_empty());
    assert_eq!(
        mounter.events(),
        vec![MountEvent::Unmount {
            target: stray.clone(),
            lazy: true
        }]
    );
    assert!(!stray.exists());
    assert!(before.exists());
    assert_eq!(mounter.live(), vec![before]);
    assert!(env.root.exists());
}

#[test]
fn test_steps_out_of_order_are_rejected() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut session = ChrootSession::new(&env.root, &mounter);
    assert!(matches!(
        session.mount_binds(two_binds(&env)),
        Err(Error::Mount(_))
    ));
    assert!(session.run(&[], None).is_err());
    assert!(mounter.events().is_empty());
    assert!(!env.root.join(LOCK_FILE).exists());
}

#[test]
fn test_missing_root_is_rejected() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();

    let mut session = ChrootSession::new(env.base.join("absent"), &mounter);
    assert!(matches!(session.acquire_lock(), Err(Error::Mount(_))));
}

#[test]
fn test_image_root_device_prefers_root_partition() {
    let env = TestEnv::new();
    let fixture = GptFixture::new(
        4096,
        vec![
            Some(EntryFixture::new("efi", 34, 2047)),
            None,
            Some(EntryFixture::new("root", 2048, 2200)),
            Some(EntryFixture::new("home", 2201, 4000)),
        ],
    );
    let image = fixture.write(&env.base.join("disk.raw"));
    assert_eq!(root_device(&image, "/dev/loop7"), "/dev/loop7p3");

    let fixture = GptFixture::new(
        4096,
        vec![
            Some(EntryFixture::new("efi", 34, 100)),
            Some(EntryFixture::new("data", 2048, 4000)),
        ],
    );
    let image = fixture.write(&env.base.join("disk2.raw"));
    assert_eq!(root_device(&image, "/dev/loop7"), "/dev/loop7p2");
}

#[test]
fn test_image_without_gpt_uses_whole_device() {
    let env = TestEnv::new();
    let image = env.base.join("plain.raw");
    fs::write(&image, vec![0u8; 4096]).unwrap();

    let device = env.base.join("no-such-loop").display().to_string();
    assert_eq!(root_device(&image, &device), device);
}

#[test]
fn test_failed_bind_releases_earlier_binds_and_lock() {
    let env = TestEnv::new();
    let mounter = FakeMounter::failing_bind("mnt/b");
    let opts = explicit_binds(&env);

    let err = run_in_chroot(&env.root, &opts, &mounter).unwrap_err();
    assert!(
        matches!(err.downcast_ref::<Error>(), Some(Error::Mount(_))),
        "{:#}",
        err
    );
    assert_eq!(
        mounter.events(),
        vec![
            MountEvent::Bind(env.root.join("mnt/a")),
            MountEvent::Unmount {
                target: env.root.join("mnt/a"),
                lazy: true
            },
        ]
    );
    assert!(mounter.live().is_empty());
    assert!(!env.root.join(LOCK_FILE).exists());

    let mut next = ChrootSession::new(&env.root, &mounter);
    next.acquire_lock().unwrap();
}

#[test]
fn test_saving_onto_the_root_is_refused() {
    let env = TestEnv::new();
    let mounter = FakeMounter::new();
    let mut opts = explicit_binds(&env);
    opts.saveto = Some(env.root.clone());

    let err = run_in_chroot(&env.root, &opts, &mounter).unwrap_err();
    assert!(err.to_string().contains("root being entered"), "{}", err);
    assert!(mounter.events().is_empty());
    assert!(!env.root.join(LOCK_FILE).exists());
}

#[test]
fn test_save_root_drops_host_entries() {
    let env = TestEnv::new();
    fs::create_dir_all(env.root.join("etc")).unwrap();
    fs::create_dir_all(env.root.join("dev")).unwrap();
    fs::write(env.root.join("etc/os-release"), "NAME=demo\n").unwrap();
    fs::write(env.root.join("etc/mtab"), "proc /proc proc rw 0 0\n").unwrap();
    fs::write(env.root.join(LOCK_FILE), "1\n").unwrap();
    std::os::unix::fs::symlink("/proc/self/fd/0", env.root.join("dev/stdin")).unwrap();
    std::os::unix::fs::symlink("/proc/self/fd", env.root.join("dev/fd")).unwrap();

    let saved = env.base.join("saved/demo");
    save_root(&env.root, &saved).unwrap();

    assert_eq!(
        fs::read_to_string(saved.join("etc/os-release")).unwrap(),
        "NAME=demo\n"
    );
    assert!(saved.join("dev").is_dir());
    for gone in ["etc/mtab", "dev/stdin", "dev/fd", LOCK_FILE] {
        assert!(fs::symlink_metadata(saved.join(gone)).is_err(), "{} kept", gone);
    }
    assert!(env.root.join("etc/mtab").exists());

    let err = save_root(&env.root, &saved).unwrap_err();
    assert!(err.to_string().contains("already exists"), "{}", err);
}
