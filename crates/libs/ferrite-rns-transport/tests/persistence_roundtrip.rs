mod common;

use tempfile::TempDir;

use rns_transport::storage::FsStorage;

use common::{node, pump, registered_destination};

#[test]
fn paths_survive_a_restart_through_storage() {
    let temp = TempDir::new().expect("temp dir");
    let now = 1000.0;

    let mut sender = node("persist-sender", false);
    let (destination, _) = registered_destination(&mut sender, "app", "persist.one");

    // First life: learn a path, persist on the cull sweep.
    {
        let mut receiver = node("persist-receiver", false);
        receiver
            .transport
            .attach_storage(Box::new(FsStorage::new(temp.path())), now);

        sender.transport.announce(&destination, None, now).expect("announce");
        pump(&sender, &mut receiver, now);
        assert!(receiver.transport.has_path(&destination, now));

        receiver.transport.jobs(now + 1.0);
    }

    // Second life: same interface identity, fresh tables, restored path.
    let mut revived = node("persist-receiver", false);
    assert!(!revived.transport.has_path(&destination, now));
    revived
        .transport
        .attach_storage(Box::new(FsStorage::new(temp.path())), now + 10.0);

    assert!(revived.transport.has_path(&destination, now + 10.0));
    assert_eq!(revived.transport.hops_to(&destination), Some(1));
}

#[test]
fn restore_skips_paths_for_missing_interfaces() {
    let temp = TempDir::new().expect("temp dir");
    let now = 1000.0;

    let mut sender = node("skip-sender", false);
    let (destination, _) = registered_destination(&mut sender, "app", "persist.two");

    {
        let mut receiver = node("skip-receiver", false);
        receiver
            .transport
            .attach_storage(Box::new(FsStorage::new(temp.path())), now);
        sender.transport.announce(&destination, None, now).expect("announce");
        pump(&sender, &mut receiver, now);
        receiver.transport.jobs(now + 1.0);
    }

    // Different node name means a different interface hash; the persisted
    // path no longer has a registered interface and must be dropped.
    let mut different = node("skip-receiver-other", false);
    different
        .transport
        .attach_storage(Box::new(FsStorage::new(temp.path())), now + 10.0);
    assert!(!different.transport.has_path(&destination, now + 10.0));
}
