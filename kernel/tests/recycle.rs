//! Group exit and recycling, end to end

mod common;

use chcore_kernel::recycle::{RING_ENTRY_LEN, RING_HEADER_LEN};
use chcore_kernel::{
    Badge, Blocking, ExitRecord, KernelError, ObjectType, ThreadArgs, ThreadState, CAP_GROUP_SLOT,
};
use common::{boot, is_current, lookup, map_rw, read_user, spawn_group};

const RING: u64 = 0x50_0000;

#[test]
fn test_killed_group_is_reported_and_recycled() {
    let b = boot(1);
    let k = &b.kernel;
    map_rw(k, 0, CAP_GROUP_SLOT, RING, 0x1000);
    let recycle_notif = k.sys_create_notification(0).unwrap();
    k.sys_register_recycle(0, recycle_notif, RING).unwrap();

    let threads_before = k.objects().live(ObjectType::Thread);
    let groups_before = k.objects().live(ObjectType::CapGroup);
    let vmspaces_before = k.objects().live(ObjectType::VmSpace);

    // A victim with one thread parked on a notification shared with root.
    let (victim_cap, victim) = spawn_group(k, 0, "victim", 0xBEEF);
    let shared = k.sys_create_notification(0).unwrap();
    let shared_obj = lookup(k, &b.root_group, shared, ObjectType::Notification);
    let in_victim = k.sys_transfer_caps(0, victim_cap, &[shared]).unwrap()[0];
    let worker_cap = k
        .sys_create_thread(
            0,
            ThreadArgs {
                cap_group: victim_cap,
                pc: 0x1000,
                sp: 0,
                arg: 0,
                prio: 30,
                affinity: None,
            },
        )
        .unwrap();
    let worker = lookup(k, &b.root_group, worker_cap, ObjectType::Thread);
    k.return_to_user(0);
    assert!(is_current(k, 0, &worker));
    assert!(k.sys_wait(0, in_victim, true, None).unwrap().is_blocked());
    assert!(is_current(k, 0, &b.root_thread));

    k.sys_kill_group(0, victim_cap).unwrap();
    assert!(worker.as_thread().unwrap().is_exiting());
    assert_eq!(k.sys_wait(0, recycle_notif, false, None), Ok(Blocking::Done(())));
    let header = read_user(k, &b.root_group, RING, RING_HEADER_LEN);
    assert_eq!(u32::from_le_bytes([header[4], header[5], header[6], header[7]]), 1);
    let entry = read_user(k, &b.root_group, RING + RING_HEADER_LEN as u64, RING_ENTRY_LEN);
    assert_eq!(
        ExitRecord::decode(&entry),
        Some(ExitRecord {
            badge: Badge(0xBEEF),
            exit_code: 0
        })
    );

    k.sys_cap_group_recycle(0, victim_cap).unwrap();
    assert!(!victim.is_alive());
    assert!(!worker.is_alive());
    assert_eq!(worker.as_thread().unwrap().state(), ThreadState::Exited);
    assert_eq!(k.queue_membership(&worker), 0);

    // Root still holds the shared notification, so it stays usable.
    assert!(shared_obj.is_alive());
    assert_eq!(shared_obj.refcount(), 1);
    k.sys_notify(0, shared).unwrap();

    assert_eq!(k.objects().live(ObjectType::Thread), threads_before);
    assert_eq!(k.objects().live(ObjectType::CapGroup), groups_before);
    assert_eq!(k.objects().live(ObjectType::VmSpace), vmspaces_before);
    assert_eq!(
        k.sys_kill_group(0, victim_cap),
        Err(KernelError::InvalidArgument)
    );
}

#[test]
fn test_last_thread_exit_reports_group() {
    let b = boot(1);
    let k = &b.kernel;
    map_rw(k, 0, CAP_GROUP_SLOT, RING, 0x1000);
    let recycle_notif = k.sys_create_notification(0).unwrap();
    k.sys_register_recycle(0, recycle_notif, RING).unwrap();

    let (child_cap, child) = spawn_group(k, 0, "short-lived", 5);
    k.sys_create_thread(
        0,
        ThreadArgs {
            cap_group: child_cap,
            pc: 0x1000,
            sp: 0,
            arg: 0,
            prio: 40,
            affinity: None,
        },
    )
    .unwrap();
    k.return_to_user(0);
    assert!(!is_current(k, 0, &b.root_thread));
    k.sys_thread_exit(0).unwrap();
    assert!(is_current(k, 0, &b.root_thread));

    let group = child.as_cap_group().unwrap();
    assert!(group.has_exited());
    assert_eq!(group.live_threads(), 0);
    assert_eq!(k.sys_wait(0, recycle_notif, false, None), Ok(Blocking::Done(())));
    k.sys_cap_group_recycle(0, child_cap).unwrap();
    assert!(!child.is_alive());
}
