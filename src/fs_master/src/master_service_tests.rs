#[cfg(test)]
mod tests {
    use crate::master_service::{MasterConfig, MasterService};
    use crate::worker_registry::WORKER_STATE_LOST;
    use memfs_lib::{
        registered_master_start_ms, registered_worker_id, CommandType, FileId, MasterHandler,
        MemFsError, NetAddress,
    };
    use std::time::Duration;

    fn create_test_master() -> MasterService {
        MasterService::new(MasterConfig {
            underfs_address: "hdfs://ufs:9000".to_string(),
            ..Default::default()
        })
    }

    fn worker_addr(port: u16) -> NetAddress {
        NetAddress::new("worker-host", port)
    }

    async fn register_worker(master: &MasterService, port: u16, files: Vec<FileId>) -> i64 {
        let rv = master
            .worker_register(worker_addr(port), 1 << 30, 0, files)
            .await
            .unwrap();
        registered_worker_id(rv)
    }

    // ==================== Namespace ====================

    #[tokio::test]
    async fn test_first_created_file_gets_id_one() {
        let master = create_test_master();
        let id = master
            .user_create_file("/a/b.dat".to_string())
            .await
            .unwrap();
        assert_eq!(id, 1);
        assert_eq!(
            master.user_get_file_id("/a/b.dat".to_string()).await.unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_create_twice_fails() {
        let master = create_test_master();
        master.user_create_file("/f".to_string()).await.unwrap();
        let err = master.user_create_file("/f".to_string()).await.unwrap_err();
        assert!(matches!(err, MemFsError::FileAlreadyExist(_)));
    }

    #[tokio::test]
    async fn test_get_file_id_absent_is_minus_one() {
        let master = create_test_master();
        assert_eq!(
            master.user_get_file_id("/nope".to_string()).await.unwrap(),
            -1
        );
    }

    #[tokio::test]
    async fn test_rename_round_trip_preserves_id() {
        let master = create_test_master();
        let id = master.user_create_file("/a".to_string()).await.unwrap();
        master
            .user_rename_file("/a".to_string(), "/b".to_string())
            .await
            .unwrap();
        master
            .user_rename_file("/b".to_string(), "/a".to_string())
            .await
            .unwrap();
        assert_eq!(master.user_get_file_id("/a".to_string()).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_number_of_files() {
        let master = create_test_master();
        master.user_mkdir("/d".to_string()).await.unwrap();
        master.user_create_file("/d/a".to_string()).await.unwrap();
        master.user_create_file("/d/b".to_string()).await.unwrap();
        assert_eq!(
            master.user_get_number_of_files("/d".to_string()).await.unwrap(),
            2
        );
        assert_eq!(
            master
                .user_get_number_of_files("/d/a".to_string())
                .await
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_ls_and_list_files() {
        let master = create_test_master();
        master.user_create_file("/d/x/f1".to_string()).await.unwrap();
        master.user_create_file("/d/f2".to_string()).await.unwrap();

        let direct = master.user_ls("/d".to_string(), false).await.unwrap();
        assert_eq!(direct, vec!["/d/f2".to_string(), "/d/x".to_string()]);

        let all = master.user_ls("/d".to_string(), true).await.unwrap();
        assert!(all.contains(&"/d/x/f1".to_string()));
        assert!(all.contains(&"/d/f2".to_string()));
        assert!(!all.contains(&"/d".to_string()));

        let ids = master.user_list_files("/d".to_string(), true).await.unwrap();
        assert_eq!(ids.len(), 3); // f1, f2 and the folder /d/x

        let single = master
            .user_list_files("/d/f2".to_string(), false)
            .await
            .unwrap();
        assert_eq!(single.len(), 1);
    }

    #[tokio::test]
    async fn test_liststatus_rejects_bad_path() {
        let master = create_test_master();
        assert!(matches!(
            master.liststatus("relative".to_string()).await.unwrap_err(),
            MemFsError::InvalidPath(_)
        ));
        assert!(matches!(
            master.liststatus("/absent".to_string()).await.unwrap_err(),
            MemFsError::FileDoesNotExist(_)
        ));
    }

    #[tokio::test]
    async fn test_underfs_address() {
        let master = create_test_master();
        assert_eq!(
            master.user_get_underfs_address().await.unwrap(),
            "hdfs://ufs:9000"
        );
    }

    #[tokio::test]
    async fn test_user_ids_are_monotone() {
        let master = create_test_master();
        let a = master.user_get_user_id().await.unwrap();
        let b = master.user_get_user_id().await.unwrap();
        assert!(b > a);
    }

    // ==================== Registration encoding ====================

    #[tokio::test]
    async fn test_registration_value_decodes() {
        let master = create_test_master();
        let rv = master
            .worker_register(worker_addr(7001), 1 << 30, 0, Vec::new())
            .await
            .unwrap();
        assert_eq!(registered_worker_id(rv), 1);
        assert_eq!(registered_master_start_ms(rv), master.start_time_ms());
    }

    // ==================== Create & cache happy path ====================

    #[tokio::test]
    async fn test_create_and_cache_happy_path() {
        let master = create_test_master();
        let fid = master
            .user_create_file("/a/b.dat".to_string())
            .await
            .unwrap();
        assert_eq!(fid, 1);

        let wid = register_worker(&master, 7001, Vec::new()).await;
        master.worker_cache_file(wid, 4096, fid, 4096).await.unwrap();

        let locations = master.user_get_file_locations_by_id(fid).await.unwrap();
        assert_eq!(locations, vec![worker_addr(7001)]);

        let info = master.user_get_client_file_info_by_id(fid).await.unwrap();
        assert!(info.in_memory);
        assert!(info.ready);
        assert_eq!(info.size_bytes, 4096);
    }

    #[tokio::test]
    async fn test_cache_size_disagreement_is_suspect() {
        let master = create_test_master();
        let fid = master
            .user_create_file("/a/b.dat".to_string())
            .await
            .unwrap();
        let wid = register_worker(&master, 7001, Vec::new()).await;
        master.worker_cache_file(wid, 4096, fid, 4096).await.unwrap();

        let err = master
            .worker_cache_file(wid, 8192, fid, 8192)
            .await
            .unwrap_err();
        assert!(matches!(err, MemFsError::SuspectedFileSize(_)));

        let info = master.user_get_client_file_info_by_id(fid).await.unwrap();
        assert_eq!(info.size_bytes, 4096);
        assert!(info.in_memory);
    }

    #[tokio::test]
    async fn test_cache_unknown_file_fails() {
        let master = create_test_master();
        let wid = register_worker(&master, 7001, Vec::new()).await;
        assert!(master.worker_cache_file(wid, 10, 99, 10).await.is_err());
    }

    // ==================== Checkpoints ====================

    #[tokio::test]
    async fn test_add_checkpoint_marks_ready() {
        let master = create_test_master();
        let fid = master.user_create_file("/cp".to_string()).await.unwrap();
        master
            .add_checkpoint(-1, fid, 512, "/ufs/data/cp".to_string())
            .await
            .unwrap();
        let info = master.user_get_client_file_info_by_id(fid).await.unwrap();
        assert!(info.ready);
        assert!(!info.in_memory);
        assert_eq!(info.checkpoint_path, "/ufs/data/cp");
        // Ready with no locations is legal; the client reads from the UFS.
        let locations = master.user_get_file_locations_by_id(fid).await.unwrap();
        assert!(locations.is_empty());
    }

    #[tokio::test]
    async fn test_checkpoint_size_disagreement() {
        let master = create_test_master();
        let fid = master.user_create_file("/cp".to_string()).await.unwrap();
        master
            .add_checkpoint(-1, fid, 512, "/ufs/data/cp".to_string())
            .await
            .unwrap();
        let err = master
            .add_checkpoint(-1, fid, 1024, "/ufs/data/cp2".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, MemFsError::SuspectedFileSize(_)));
    }

    // ==================== Membership ====================

    #[tokio::test]
    async fn test_heartbeat_from_unknown_worker_commands_register() {
        let master = create_test_master();
        let cmd = master.worker_heartbeat(42, 0, Vec::new()).await.unwrap();
        assert_eq!(cmd.command_type, CommandType::Register);
    }

    #[tokio::test]
    async fn test_reregistration_rebuilds_placement() {
        let master = create_test_master();
        let fid = master.user_create_file("/f".to_string()).await.unwrap();
        let wid = register_worker(&master, 7001, Vec::new()).await;
        master.worker_cache_file(wid, 8, fid, 8).await.unwrap();

        // The worker comes back (same address) declaring its resident set.
        let new_wid = register_worker(&master, 7001, vec![fid]).await;
        assert_ne!(new_wid, wid);
        let locations = master.user_get_file_locations_by_id(fid).await.unwrap();
        assert_eq!(locations, vec![worker_addr(7001)]);

        // The old id is gone; a heartbeat under it is told to register.
        let cmd = master.worker_heartbeat(wid, 0, Vec::new()).await.unwrap();
        assert_eq!(cmd.command_type, CommandType::Register);
    }

    #[tokio::test]
    async fn test_register_with_stale_files_schedules_free() {
        let master = create_test_master();
        let wid = register_worker(&master, 7001, vec![17, 23]).await;
        let cmd = master.worker_heartbeat(wid, 0, Vec::new()).await.unwrap();
        assert_eq!(cmd.command_type, CommandType::Free);
        let mut data = cmd.data;
        data.sort_unstable();
        assert_eq!(data, vec![17, 23]);
    }

    #[tokio::test]
    async fn test_delete_then_heartbeat_frees_holders() {
        let master = create_test_master();
        let fid = master.user_create_file("/a/f".to_string()).await.unwrap();
        let wid = register_worker(&master, 7001, Vec::new()).await;
        master.worker_cache_file(wid, 16, fid, 16).await.unwrap();

        assert!(master
            .user_delete_by_path("/a".to_string(), true)
            .await
            .unwrap());

        let cmd = master.worker_heartbeat(wid, 16, Vec::new()).await.unwrap();
        assert_eq!(cmd.command_type, CommandType::Free);
        assert_eq!(cmd.data, vec![fid]);

        // The worker evicts and reports; the next heartbeat is quiet.
        let cmd = master.worker_heartbeat(wid, 0, vec![fid]).await.unwrap();
        assert_eq!(cmd.command_type, CommandType::Nothing);
        assert!(matches!(
            master.user_get_file_locations_by_id(fid).await.unwrap_err(),
            MemFsError::FileDoesNotExist(_)
        ));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let master = create_test_master();
        assert!(master
            .user_delete_by_path("/absent".to_string(), false)
            .await
            .unwrap());
        assert!(master.user_delete_by_id(99, false).await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_non_empty_folder_needs_recursive() {
        let master = create_test_master();
        master.user_create_file("/d/f".to_string()).await.unwrap();
        let err = master
            .user_delete_by_path("/d".to_string(), false)
            .await
            .unwrap_err();
        assert!(matches!(err, MemFsError::InvalidPath(_)));
    }

    #[tokio::test]
    async fn test_lost_worker_leaves_placement() {
        let master = MasterService::new(MasterConfig {
            worker_timeout_ms: 0,
            ..Default::default()
        });
        let fid = master.user_create_file("/f".to_string()).await.unwrap();
        let wid = register_worker(&master, 7001, Vec::new()).await;
        master.worker_cache_file(wid, 4, fid, 4).await.unwrap();

        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(master.sweep_lost_workers().unwrap(), 1);

        let locations = master.user_get_file_locations_by_id(fid).await.unwrap();
        assert!(locations.is_empty());
        let infos = master.get_workers_info().await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].state, WORKER_STATE_LOST);
    }

    // ==================== Placement queries ====================

    #[tokio::test]
    async fn test_get_worker_without_workers_fails() {
        let master = create_test_master();
        let err = master
            .user_get_worker(true, String::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MemFsError::NoLocalWorker(_)));
    }

    #[tokio::test]
    async fn test_get_worker_by_host() {
        let master = create_test_master();
        register_worker(&master, 7001, Vec::new()).await;

        let random = master
            .user_get_worker(true, String::new())
            .await
            .unwrap();
        assert_eq!(random, worker_addr(7001));

        let by_host = master
            .user_get_worker(false, "worker-host".to_string())
            .await
            .unwrap();
        assert_eq!(by_host, worker_addr(7001));

        let err = master
            .user_get_worker(false, "elsewhere".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, MemFsError::NoLocalWorker(_)));
    }

    // ==================== Pins ====================

    #[tokio::test]
    async fn test_pinlist_marks_new_files() {
        let master = MasterService::new(MasterConfig {
            pinlist: vec!["/pinned".to_string()],
            ..Default::default()
        });
        let fid = master
            .user_create_file("/pinned/f".to_string())
            .await
            .unwrap();
        let other = master.user_create_file("/plain".to_string()).await.unwrap();

        let pins = master.worker_get_pin_id_list().await.unwrap();
        assert!(pins.contains(&fid));
        assert!(!pins.contains(&other));
        assert!(master
            .user_get_client_file_info_by_id(fid)
            .await
            .unwrap()
            .need_pin);

        master.user_unpin_file(fid).await.unwrap();
        assert!(!master.worker_get_pin_id_list().await.unwrap().contains(&fid));
        assert!(!master
            .user_get_client_file_info_by_id(fid)
            .await
            .unwrap()
            .need_pin);
    }

    // ==================== Raw tables ====================

    #[tokio::test]
    async fn test_raw_table_lifecycle() {
        let master = create_test_master();
        let table_id = master
            .user_create_raw_table("/tables/t".to_string(), 3, vec![7])
            .await
            .unwrap();
        assert_eq!(
            master
                .user_get_raw_table_id("/tables/t".to_string())
                .await
                .unwrap(),
            table_id
        );
        assert_eq!(
            master
                .user_get_raw_table_id("/tables".to_string())
                .await
                .unwrap(),
            0
        );

        let info = master
            .user_get_client_raw_table_info_by_path("/tables/t".to_string())
            .await
            .unwrap();
        assert_eq!(info.columns, 3);
        assert_eq!(info.metadata, vec![7]);

        master
            .user_update_raw_table_metadata(table_id, vec![8, 9])
            .await
            .unwrap();
        let info = master
            .user_get_client_raw_table_info_by_id(table_id)
            .await
            .unwrap();
        assert_eq!(info.metadata, vec![8, 9]);

        // The column folders are ordinary children named 0..columns-1.
        let children = master.liststatus("/tables/t".to_string()).await.unwrap();
        let names: Vec<String> = children.into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["0", "1", "2"]);
    }

    #[tokio::test]
    async fn test_raw_table_bad_columns() {
        let master = create_test_master();
        assert!(matches!(
            master
                .user_create_raw_table("/t".to_string(), 0, Vec::new())
                .await
                .unwrap_err(),
            MemFsError::TableColumn(_)
        ));
    }

    #[tokio::test]
    async fn test_update_metadata_of_plain_folder_fails() {
        let master = create_test_master();
        master.user_mkdir("/d".to_string()).await.unwrap();
        let id = master.user_get_file_id("/d".to_string()).await.unwrap();
        assert!(matches!(
            master
                .user_update_raw_table_metadata(id, vec![1])
                .await
                .unwrap_err(),
            MemFsError::TableDoesNotExist(_)
        ));
    }
}
