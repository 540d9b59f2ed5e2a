//! Capability lifetime: revocation under concurrency and refcount conservation

mod common;

use chcore_kernel::{Cap, CapRights, KernelError, ObjectType, ThreadArgs, CAP_GROUP_SLOT};
use common::{boot, lookup, spawn_group};
use proptest::prelude::*;

#[test]
fn test_revoke_all_races_copies_on_another_core() {
    let b = boot(2);
    let k = &b.kernel;
    k.sys_create_thread(0, ThreadArgs::own(0x1000, 10).with_affinity(1))
        .unwrap();
    k.handle_ipi(1);
    assert!(!k.is_idle(1));

    let notif = k.sys_create_notification(0).unwrap();
    let obj = lookup(k, &b.root_group, notif, ObjectType::Notification);
    let freed_before = k.objects().freed(ObjectType::Notification);

    let copied = std::thread::scope(|s| {
        let copier = s.spawn(|| {
            let mut copied = 0usize;
            for _ in 0..5_000 {
                match k.sys_cap_copy(1, CAP_GROUP_SLOT, notif, false, CapRights::ALL) {
                    Ok(copy) => {
                        copied += 1;
                        match k.sys_revoke_cap(1, copy, false) {
                            Ok(()) | Err(KernelError::BadCapability) => {}
                            Err(e) => panic!("revoking copy failed: {e:?}"),
                        }
                    }
                    Err(KernelError::BadCapability) => break,
                    Err(e) => panic!("copy failed: {e:?}"),
                }
            }
            copied
        });
        while obj.copy_count() < 2 && !copier.is_finished() {
            std::hint::spin_loop();
        }
        k.sys_revoke_cap(0, notif, true).unwrap();
        copier.join().unwrap()
    });

    assert!(copied > 0);
    assert!(!obj.is_alive());
    assert_eq!(obj.refcount(), 0);
    assert_eq!(k.objects().freed(ObjectType::Notification), freed_before + 1);
    assert_eq!(
        k.sys_cap_copy(1, CAP_GROUP_SLOT, notif, false, CapRights::ALL),
        Err(KernelError::BadCapability)
    );
}

#[test]
fn test_copies_in_many_groups_revoked_together() {
    let b = boot(1);
    let k = &b.kernel;
    let notif = k.sys_create_notification(0).unwrap();
    let obj = lookup(k, &b.root_group, notif, ObjectType::Notification);
    let peers: Vec<_> = (0..4).map(|i| spawn_group(k, 0, "peer", 10 + i)).collect();
    for (cap, _) in &peers {
        k.sys_transfer_caps(0, *cap, &[notif, notif]).unwrap();
    }
    assert_eq!(obj.refcount(), 9);

    // Read-only copies cannot revoke everything.
    let weak = k
        .sys_cap_copy(0, CAP_GROUP_SLOT, notif, true, CapRights::READ)
        .unwrap();
    assert_eq!(k.sys_revoke_cap(0, weak, true), Err(KernelError::PermissionDenied));

    k.sys_revoke_cap(0, notif, true).unwrap();
    assert!(!obj.is_alive());
    assert_eq!(obj.copy_count(), 0);
    for (_, group) in &peers {
        assert!(k.obj_get(group, Cap::from_raw(2), ObjectType::Notification).is_err());
    }
}

#[derive(Debug, Clone)]
enum CapOp {
    CopyLocal(usize),
    Transfer(usize),
    Free(usize),
    RevokeAll(usize),
}

fn cap_op() -> impl Strategy<Value = CapOp> {
    prop_oneof![
        3 => any::<usize>().prop_map(CapOp::CopyLocal),
        2 => any::<usize>().prop_map(CapOp::Transfer),
        3 => any::<usize>().prop_map(CapOp::Free),
        1 => any::<usize>().prop_map(CapOp::RevokeAll),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_refcount_equals_slots_holding_object(ops in prop::collection::vec(cap_op(), 1..48)) {
        let b = boot(1);
        let k = &b.kernel;
        let (peer_cap, _peer) = spawn_group(k, 0, "peer", 2);
        let notif = k.sys_create_notification(0).unwrap();
        let obj = lookup(k, &b.root_group, notif, ObjectType::Notification);
        let freed_before = k.objects().freed(ObjectType::Notification);

        let mut local: Vec<Cap> = vec![notif];
        let mut remote: Vec<Cap> = Vec::new();
        for op in ops {
            if local.is_empty() {
                break;
            }
            match op {
                CapOp::CopyLocal(i) => {
                    let src = local[i % local.len()];
                    local.push(k.sys_cap_copy(0, CAP_GROUP_SLOT, src, false, CapRights::ALL).unwrap());
                }
                CapOp::Transfer(i) => {
                    let src = local[i % local.len()];
                    remote.extend(k.sys_transfer_caps(0, peer_cap, &[src]).unwrap());
                }
                CapOp::Free(i) => {
                    let cap = local.remove(i % local.len());
                    k.sys_revoke_cap(0, cap, false).unwrap();
                }
                CapOp::RevokeAll(i) => {
                    k.sys_revoke_cap(0, local[i % local.len()], true).unwrap();
                    local.clear();
                    remote.clear();
                }
            }
            prop_assert_eq!(obj.refcount(), local.len() + remote.len());
            prop_assert_eq!(obj.copy_count(), local.len() + remote.len());
        }

        let gone = local.is_empty() && remote.is_empty();
        prop_assert_eq!(obj.is_alive(), !gone);
        let freed = k.objects().freed(ObjectType::Notification) - freed_before;
        prop_assert_eq!(freed, usize::from(gone));
    }
}
