//! Integration tests for the striped copy engine over the loopback fabric

use std::sync::Arc;

use famsvc::{
    memory::encode_server_list, CopyRequest, ErrorKind, Fam, FamOptions, LocalMemoryService,
    LoopbackFabric, MemoryServerDirectory, MemoryServerInfo, MemoryService, NodeAddr, Owner,
    Permission, ServiceConfig,
};
use tempfile::TempDir;

#[cfg(test)]
mod tests {
    use super::*;

    struct Cluster {
        _temp_dir: TempDir,
        fabric: Arc<LoopbackFabric>,
        directory: Arc<MemoryServerDirectory>,
        servers: Vec<Arc<dyn MemoryService>>,
    }

    fn cluster(count: u64) -> Cluster {
        let temp_dir = TempDir::new().unwrap();
        let fabric = Arc::new(LoopbackFabric::new());
        let directory = Arc::new(MemoryServerDirectory::new());

        let servers: Vec<Arc<dyn MemoryService>> = (0..count)
            .map(|id| {
                let config = ServiceConfig::new(id)
                    .with_backup_dir(temp_dir.path().join("backups"))
                    .with_credentials(Owner::new(1000, 1000));
                let service: Arc<dyn MemoryService> = Arc::new(
                    LocalMemoryService::with_fabric(config, fabric.clone(), directory.clone())
                        .unwrap(),
                );
                fabric.attach(&service);
                service
            })
            .collect();

        let infos: Vec<MemoryServerInfo> = servers
            .iter()
            .map(|s| MemoryServerInfo {
                id: s.get_memory_server_id(),
                node_addr: NodeAddr::new(s.get_addr()),
            })
            .collect();
        let buffer = encode_server_list(&infos).unwrap();
        servers[0]
            .update_memserver_addrlist(&buffer, infos.len() as u64)
            .unwrap();

        Cluster {
            _temp_dir: temp_dir,
            fabric,
            directory,
            servers,
        }
    }

    /// Byte at logical position `p` of the striped source
    fn pattern(p: u64) -> u8 {
        (p * 7 % 251) as u8
    }

    #[test]
    fn test_striped_source_into_unstriped_destination() {
        let c = cluster(3);
        assert_eq!(c.directory.snapshot().len(), 3);

        let interleave = 64;
        let size = 256;
        // Source striped over servers 0 and 1; each holds half the bytes.
        let mut src_offsets = Vec::new();
        let mut src_keys = Vec::new();
        let mut src_base_addrs = Vec::new();
        let mut src_region = 0;
        for server in 0..2u64 {
            let svc = &c.servers[server as usize];
            src_region = svc.create_region("src", 4096, Permission::new(0o600)).unwrap();
            let item = svc.allocate(src_region, size / 2, Permission::new(0o600)).unwrap();
            let mut local = vec![0u8; (size / 2) as usize];
            for p in 0..size {
                if (p / interleave) % 2 == server {
                    let at = (p / (interleave * 2)) * interleave + p % interleave;
                    local[at as usize] = pattern(p);
                }
            }
            svc.put_atomic(src_region, &item.memory.capability, item.offset, local)
                .unwrap();
            src_offsets.push(item.offset);
            src_keys.push(item.memory.capability.key);
            src_base_addrs.push(item.memory.capability.base_addr);
        }

        let dest_svc = &c.servers[2];
        let dest_region = dest_svc.create_region("dst", 4096, Permission::new(0o600)).unwrap();
        let dest = dest_svc.allocate(dest_region, 512, Permission::new(0o600)).unwrap();

        let request = CopyRequest {
            src_region_id: src_region,
            src_offsets,
            src_used_memsrv_cnt: 2,
            src_copy_start: 16,
            src_copy_end: size,
            src_keys,
            src_base_addrs,
            src_memserver_ids: vec![0, 1],
            src_interleave_size: interleave,
            dest_region_id: dest_region,
            dest_offset: dest.offset,
            dest_used_memsrv_cnt: 1,
            dest_server_index: 0,
            dest_copy_start: 100,
            dest_interleave_size: 0,
            size: 200,
        };
        dest_svc.copy(&request).unwrap();

        let copied = dest_svc
            .get_atomic(dest_region, &dest.memory.capability, dest.offset + 100, 200)
            .unwrap();
        let expected: Vec<u8> = (16..216).map(pattern).collect();
        assert_eq!(copied, expected);

        let untouched = dest_svc
            .get_atomic(dest_region, &dest.memory.capability, dest.offset, 100)
            .unwrap();
        assert!(untouched.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_unstriped_source_into_striped_destination() {
        let c = cluster(2);
        let size = 192u64;
        let interleave = 32u64;

        let src_svc = &c.servers[0];
        let src_region = src_svc.create_region("src", 4096, Permission::new(0o600)).unwrap();
        let src = src_svc.allocate(src_region, size, Permission::new(0o600)).unwrap();
        let data: Vec<u8> = (0..size).map(pattern).collect();
        src_svc
            .put_atomic(src_region, &src.memory.capability, src.offset, data)
            .unwrap();

        // Each destination server runs its share of the copy.
        let mut dest_items = Vec::new();
        for index in 0..2u64 {
            let svc = &c.servers[index as usize];
            let region = svc.create_region("dst", 4096, Permission::new(0o600)).unwrap();
            let item = svc.allocate(region, size / 2, Permission::new(0o600)).unwrap();
            let request = CopyRequest {
                src_region_id: src_region,
                src_offsets: vec![src.offset],
                src_used_memsrv_cnt: 1,
                src_copy_start: 0,
                src_copy_end: size,
                src_keys: vec![src.memory.capability.key],
                src_base_addrs: vec![src.memory.capability.base_addr],
                src_memserver_ids: vec![0],
                src_interleave_size: 0,
                dest_region_id: region,
                dest_offset: item.offset,
                dest_used_memsrv_cnt: 2,
                dest_server_index: index,
                dest_copy_start: 0,
                dest_interleave_size: interleave,
                size,
            };
            svc.copy(&request).unwrap();
            dest_items.push((region, item));
        }

        for p in 0..size {
            let index = ((p / interleave) % 2) as usize;
            let local = (p / (interleave * 2)) * interleave + p % interleave;
            let (region, item) = &dest_items[index];
            let byte = c.servers[index]
                .get_atomic(*region, &item.memory.capability, item.offset + local, 1)
                .unwrap();
            assert_eq!(byte[0], pattern(p), "logical byte {}", p);
        }
    }

    #[test]
    fn test_copy_rejections() {
        let c = cluster(2);
        let svc = &c.servers[0];
        let region = svc.create_region("r", 4096, Permission::new(0o600)).unwrap();
        let src = svc.allocate(region, 128, Permission::new(0o600)).unwrap();
        let dest = svc.allocate(region, 64, Permission::new(0o600)).unwrap();

        let base = CopyRequest {
            src_region_id: region,
            src_offsets: vec![src.offset],
            src_used_memsrv_cnt: 1,
            src_copy_start: 0,
            src_copy_end: 128,
            src_keys: vec![src.memory.capability.key],
            src_base_addrs: vec![src.memory.capability.base_addr],
            src_memserver_ids: vec![0],
            src_interleave_size: 0,
            dest_region_id: region,
            dest_offset: dest.offset,
            dest_used_memsrv_cnt: 1,
            dest_server_index: 0,
            dest_copy_start: 0,
            dest_interleave_size: 0,
            size: 64,
        };
        assert!(svc.copy(&base).is_ok());

        let mut too_big = base.clone();
        too_big.size = 256;
        assert_eq!(svc.copy(&too_big).unwrap_err().kind(), ErrorKind::RangeMismatch);

        let mut overflow = base.clone();
        overflow.dest_copy_start = 32;
        assert_eq!(svc.copy(&overflow).unwrap_err().kind(), ErrorKind::InvalidRange);

        // Offsets that wrap past u64::MAX are range errors, not panics.
        let mut wrapping_dest = base.clone();
        wrapping_dest.size = 4;
        wrapping_dest.dest_copy_start = u64::MAX - 3;
        assert_eq!(
            svc.copy(&wrapping_dest).unwrap_err().kind(),
            ErrorKind::InvalidRange
        );

        let mut wrapping_src = base.clone();
        wrapping_src.src_offsets = vec![u64::MAX - 8];
        wrapping_src.src_copy_start = 16;
        wrapping_src.size = 16;
        assert_eq!(
            svc.copy(&wrapping_src).unwrap_err().kind(),
            ErrorKind::InvalidRange
        );

        let mut wrapping_base = base.clone();
        wrapping_base.dest_offset = u64::MAX - 8;
        wrapping_base.dest_copy_start = 16;
        wrapping_base.size = 16;
        assert_eq!(
            svc.copy(&wrapping_base).unwrap_err().kind(),
            ErrorKind::InvalidRange
        );

        let mut bad_key = base.clone();
        bad_key.src_keys = vec![src.memory.capability.key ^ 1];
        assert_eq!(
            svc.copy(&bad_key).unwrap_err().kind(),
            ErrorKind::PermissionDenied
        );

        let mut unknown_server = base;
        unknown_server.src_memserver_ids = vec![7];
        assert_eq!(
            svc.copy(&unknown_server).unwrap_err().kind(),
            ErrorKind::NotFound
        );
    }

    #[test]
    fn test_detached_endpoint_is_unreachable() {
        let c = cluster(2);
        let remote = &c.servers[1];
        let region = remote.create_region("src", 4096, Permission::new(0o600)).unwrap();
        let src = remote.allocate(region, 64, Permission::new(0o600)).unwrap();

        let local = &c.servers[0];
        let dest_region = local.create_region("src", 4096, Permission::new(0o600)).unwrap();
        assert_eq!(dest_region, region);
        let dest = local.allocate(dest_region, 64, Permission::new(0o600)).unwrap();

        let request = CopyRequest {
            src_region_id: region,
            src_offsets: vec![src.offset],
            src_used_memsrv_cnt: 1,
            src_copy_start: 0,
            src_copy_end: 64,
            src_keys: vec![src.memory.capability.key],
            src_base_addrs: vec![src.memory.capability.base_addr],
            src_memserver_ids: vec![1],
            src_interleave_size: 0,
            dest_region_id: dest_region,
            dest_offset: dest.offset,
            dest_used_memsrv_cnt: 1,
            dest_server_index: 0,
            dest_copy_start: 0,
            dest_interleave_size: 0,
            size: 64,
        };
        local.copy(&request).unwrap();

        c.fabric.detach(&NodeAddr::new(remote.get_addr()));
        assert_eq!(local.copy(&request).unwrap_err().kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_copy_between_dataitems_through_session() {
        let temp_dir = TempDir::new().unwrap();
        let service = ServiceConfig::new(0)
            .with_backup_dir(temp_dir.path().join("backups"))
            .with_credentials(Owner::new(1000, 1000));
        let fam = Fam::initialize("copy", FamOptions::default().with_service(service)).unwrap();
        let region = fam.create_region("copy", 4096, Permission::new(0o777)).unwrap();
        let src = fam.allocate(&region, 128, Permission::new(0o777)).unwrap();
        let dest = fam.allocate(&region, 128, Permission::new(0o777)).unwrap();

        let ctx = fam.default_context();
        ctx.put(&src, 0, (0..128).collect()).unwrap();
        fam.copy(&src, 32, &dest, 8, 64).unwrap().wait().unwrap();

        let copied = ctx.get(&dest, 8, 64).unwrap().wait().unwrap();
        assert_eq!(copied, (32..96).collect::<Vec<u8>>());
        assert_eq!(
            fam.copy(&src, 100, &dest, 0, 64).unwrap_err().kind(),
            ErrorKind::InvalidRange
        );
        fam.finalize("copy").unwrap();
    }
}
