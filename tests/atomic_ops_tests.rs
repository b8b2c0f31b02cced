//! Integration tests for one-sided operations against registered memory

use famsvc::{
    AccessType, AtomicValue, BitwiseOp, ErrorKind, IndexedLayout, LocalMemoryService,
    MemoryCapability, MemoryService, NodeAddr, Owner, Permission, RegionId, ServiceConfig,
    ServiceOp, StridedLayout,
};
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        _temp_dir: TempDir,
        svc: LocalMemoryService,
        region: RegionId,
        base: u64,
        cap: MemoryCapability,
    }

    fn fixture(item_size: u64) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let config = ServiceConfig::new(0)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_credentials(Owner::new(1000, 1000));
        let svc = LocalMemoryService::new(config).unwrap();
        let region = svc.create_region("atomics", 64 * 1024, Permission::new(0o600)).unwrap();
        // A leading dataitem keeps the one under test away from offset 0.
        svc.allocate(region, 256, Permission::new(0o600)).unwrap();
        let item = svc.allocate(region, item_size, Permission::new(0o600)).unwrap();
        Fixture {
            _temp_dir: temp_dir,
            base: item.offset,
            cap: item.memory.capability,
            svc,
            region,
        }
    }

    #[test]
    fn test_put_then_get() {
        let f = fixture(1024);
        f.svc
            .put_atomic(f.region, &f.cap, f.base + 100, b"one-sided".to_vec())
            .unwrap();
        assert_eq!(
            f.svc.get_atomic(f.region, &f.cap, f.base + 100, 9).unwrap(),
            b"one-sided"
        );
    }

    #[test]
    fn test_access_outside_dataitem() {
        let f = fixture(128);
        let err = f
            .svc
            .put_atomic(f.region, &f.cap, f.base + 120, vec![1; 16])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);

        // Past every dataitem.
        let err = f
            .svc
            .get_atomic(f.region, &f.cap, 60 * 1024, 8)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);
    }

    #[test]
    fn test_capability_for_other_node_is_rejected() {
        let f = fixture(128);
        let forged = MemoryCapability {
            node_addr: NodeAddr::from("loopback://99"),
            ..f.cap.clone()
        };
        let err = f.svc.get_atomic(f.region, &forged, f.base, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let unknown_key = MemoryCapability {
            key: f.cap.key ^ 0xFFFF,
            ..f.cap.clone()
        };
        let err = f.svc.get_atomic(f.region, &unknown_key, f.base, 8).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);
    }

    #[test]
    fn test_read_only_registration_allows_reads() {
        let f = fixture(128);
        f.svc.put_atomic(f.region, &f.cap, f.base, vec![5; 8]).unwrap();

        let ro = f
            .svc
            .get_dataitem_memory(f.region, f.base, AccessType::ReadOnly)
            .unwrap();
        assert_eq!(ro.offset, f.base);
        assert_eq!(ro.size, 128);
        assert_eq!(
            f.svc.get_atomic(f.region, &ro.capability, f.base, 8).unwrap(),
            vec![5; 8]
        );
        assert_eq!(
            f.svc
                .put_atomic(f.region, &ro.capability, f.base, vec![0; 8])
                .unwrap_err()
                .kind(),
            ErrorKind::PermissionDenied
        );
    }

    #[test]
    fn test_strided_scatter_gather() {
        let f = fixture(256);
        let layout = StridedLayout::new(4, 8, 16, 4);
        let data: Vec<u8> = (1..=16).collect();
        f.svc
            .scatter_strided_atomic(f.region, &f.cap, f.base, layout, data.clone())
            .unwrap();

        let raw = f.svc.get_atomic(f.region, &f.cap, f.base, 64).unwrap();
        assert_eq!(&raw[8..12], &[1, 2, 3, 4]);
        assert_eq!(&raw[12..24], &[0; 12]);
        assert_eq!(&raw[24..28], &[5, 6, 7, 8]);
        assert_eq!(&raw[56..60], &[13, 14, 15, 16]);

        let gathered = f
            .svc
            .gather_strided_atomic(f.region, &f.cap, f.base, layout)
            .unwrap();
        assert_eq!(gathered, data);
    }

    #[test]
    fn test_strided_rejections_apply_nothing() {
        let f = fixture(64);

        let overlapping = StridedLayout::new(3, 0, 2, 4);
        let err = f
            .svc
            .scatter_strided_atomic(f.region, &f.cap, f.base, overlapping, vec![1; 12])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);

        let too_long = StridedLayout::new(4, 0, 20, 8);
        let err = f
            .svc
            .scatter_strided_atomic(f.region, &f.cap, f.base, too_long, vec![1; 32])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidRange);

        let short_payload = StridedLayout::new(2, 0, 8, 4);
        let err = f
            .svc
            .scatter_strided_atomic(f.region, &f.cap, f.base, short_payload, vec![1; 7])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter);

        let raw = f.svc.get_atomic(f.region, &f.cap, f.base, 64).unwrap();
        assert!(raw.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_indexed_scatter_gather() {
        let f = fixture(128);
        let layout = IndexedLayout::new(vec![3, 0, 7], 8);
        let data: Vec<u8> = (0..24).collect();
        f.svc
            .scatter_indexed_atomic(f.region, &f.cap, f.base, layout.clone(), data.clone())
            .unwrap();

        let raw = f.svc.get_atomic(f.region, &f.cap, f.base, 64).unwrap();
        assert_eq!(&raw[24..32], &data[0..8]);
        assert_eq!(&raw[0..8], &data[8..16]);
        assert_eq!(&raw[56..64], &data[16..24]);

        let gathered = f
            .svc
            .gather_indexed_atomic(f.region, &f.cap, f.base, layout)
            .unwrap();
        assert_eq!(gathered, data);
    }

    #[test]
    fn test_indexed_scatter_with_one_bad_index_applies_none() {
        let f = fixture(64);
        let before = f.svc.get_atomic(f.region, &f.cap, f.base, 64).unwrap();

        // Element 8 would end at byte 72 of a 64-byte dataitem.
        let layout = IndexedLayout::new(vec![0, 1, 8, 2], 8);
        let err = f
            .svc
            .scatter_indexed_atomic(f.region, &f.cap, f.base, layout, vec![0xEE; 32])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidIndex);

        let after = f.svc.get_atomic(f.region, &f.cap, f.base, 64).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_bitwise_family() {
        let f = fixture(64);
        for value in [1u64, 2, 4] {
            f.svc
                .bitwise_atomic(f.region, &f.cap, f.base, BitwiseOp::Or, value.into(), false)
                .unwrap();
        }
        let prior = f
            .svc
            .bitwise_atomic(f.region, &f.cap, f.base, BitwiseOp::Xor, 0b101u64.into(), true)
            .unwrap();
        assert_eq!(prior, Some(AtomicValue::U64(7)));

        let prior = f
            .svc
            .bitwise_atomic(f.region, &f.cap, f.base, BitwiseOp::And, 0b011u64.into(), true)
            .unwrap();
        assert_eq!(prior, Some(AtomicValue::U64(0b010)));

        let raw = f.svc.get_atomic(f.region, &f.cap, f.base, 8).unwrap();
        assert_eq!(u64::from_le_bytes(raw.try_into().unwrap()), 0b010);
    }

    #[test]
    fn test_bitwise_32_bit_width() {
        let f = fixture(64);
        f.svc
            .put_atomic(f.region, &f.cap, f.base, vec![0xFF; 8])
            .unwrap();
        let prior = f
            .svc
            .bitwise_atomic(f.region, &f.cap, f.base, BitwiseOp::And, 0x0F0Fu32.into(), true)
            .unwrap();
        assert_eq!(prior, Some(AtomicValue::U32(u32::MAX)));

        let raw = f.svc.get_atomic(f.region, &f.cap, f.base, 8).unwrap();
        assert_eq!(&raw[..4], &0x0F0Fu32.to_le_bytes());
        assert_eq!(&raw[4..], &[0xFF; 4]);

        // The last four bytes of the dataitem take a 32-bit op but not a 64-bit one.
        assert!(f
            .svc
            .bitwise_atomic(f.region, &f.cap, f.base + 60, BitwiseOp::Or, 1u32.into(), false)
            .is_ok());
        assert_eq!(
            f.svc
                .bitwise_atomic(f.region, &f.cap, f.base + 60, BitwiseOp::Or, 1u64.into(), false)
                .unwrap_err()
                .kind(),
            ErrorKind::InvalidRange
        );
    }

    #[test]
    fn test_profile_counts_operations() {
        let f = fixture(64);
        f.svc.reset_profile();

        f.svc.put_atomic(f.region, &f.cap, f.base, vec![1; 16]).unwrap();
        f.svc.get_atomic(f.region, &f.cap, f.base, 16).unwrap();
        let _ = f.svc.get_atomic(f.region, &f.cap, f.base + 60, 16);

        let stats = f.svc.dump_profile();
        assert_eq!(stats.memory_server_id, 0);
        let put = stats.get(ServiceOp::Put);
        assert_eq!((put.calls, put.failures, put.bytes), (1, 0, 16));
        let get = stats.get(ServiceOp::Get);
        assert_eq!((get.calls, get.failures, get.bytes), (2, 1, 16));

        f.svc.reset_profile();
        assert_eq!(f.svc.dump_profile().total_calls(), 0);
    }

    #[test]
    fn test_server_identity() {
        let f = fixture(64);
        assert_eq!(f.svc.get_memory_server_id(), 0);
        assert_eq!(f.svc.get_addr(), b"loopback://0".to_vec());
        assert_eq!(f.svc.get_addr_size(), b"loopback://0".len());
        assert_eq!(f.svc.get_memtype(), famsvc::MemoryType::Volatile);
        assert_eq!(f.cap.node_addr.as_bytes(), &f.svc.get_addr()[..]);
    }
}
