#![allow(clippy::unwrap_used, missing_docs)]

mod common;

use common::{SimCache, make_files, quiet_config, start};
use fhcache::sim::{Fault, ROOT, SimBackend};
use fhcache::{CacheError, ChunkId, EntryId, EntryState, FIRST_COOKIE, LruConfig, QueueKind};

fn chunked_config() -> LruConfig {
    LruConfig {
        dir_chunk_size: 4,
        ..quiet_config()
    }
}

/// A directory under the root holding `files` files. Returns the directory and its children.
fn make_dir(sim: &SimBackend, name: &str, files: usize) -> (u64, Vec<u64>) {
    let dir = sim.add_dir(ROOT, name).unwrap();
    let children = (0..files)
        .map(|i| sim.add_file(dir, format!("{name}-{i:03}"), 0).unwrap())
        .collect();
    (dir, children)
}

/// Walk all of `dir`, transferring the chunk reference from one chunk to the next.
async fn walk(cache: &SimCache, dir: EntryId) -> (Vec<u64>, usize) {
    let mut ids = Vec::new();
    let mut chunks = 0;
    let mut whence = 0;
    let mut prev: Option<ChunkId> = None;
    loop {
        let chunk = cache.get_chunk(dir, prev, whence).await.unwrap();
        chunks += 1;
        ids.extend(chunk.entries_after(whence).iter().map(|d| d.id));
        prev = Some(chunk.id());
        match chunk.next_whence() {
            Some(next) => whence = next,
            None => break,
        }
    }
    cache.release_chunk(prev.unwrap());
    (ids, chunks)
}

#[tokio::test]
async fn listing_walks_every_chunk() {
    let sim = SimBackend::new();
    let (dir_id, children) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    let (ids, chunks) = walk(&cache, dir).await;
    assert_eq!(ids, children);
    assert_eq!(chunks, 3);
    assert_eq!(sim.readdir_calls(), 3);
    assert_eq!(cache.stats().chunks_used, 3);
    assert_eq!(cache.inspect(dir).unwrap().chunks, 3);
    cache.release(dir);
}

#[tokio::test]
async fn exact_multiple_of_the_chunk_size_ends_cleanly() {
    let sim = SimBackend::new();
    let (dir_id, children) = make_dir(&sim, "d", 8);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    let (ids, chunks) = walk(&cache, dir).await;
    assert_eq!(ids, children);
    assert_eq!(chunks, 2);
    cache.release(dir);
}

#[tokio::test]
async fn empty_directory_is_one_empty_chunk() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "empty", 0);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
    assert!(chunk.dirents().is_empty());
    assert!(chunk.eod());
    assert_eq!(chunk.next_whence(), None);
    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn previous_chunk_covering_whence_is_reused() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    let first = cache.get_chunk(dir, None, 0).await.unwrap();
    let whence = first.dirents()[1].cookie;
    let again = cache.get_chunk(dir, Some(first.id()), whence).await.unwrap();

    assert_eq!(again.id(), first.id());
    assert_eq!(sim.readdir_calls(), 1);
    assert_eq!(again.entries_after(whence).len(), 2);
    cache.release_chunk(again.id());
    cache.release(dir);
}

#[tokio::test]
async fn resident_chunks_are_served_without_the_backend() {
    let sim = SimBackend::new();
    let (dir_id, children) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    walk(&cache, dir).await;
    let (ids, _) = walk(&cache, dir).await;
    assert_eq!(ids, children);
    assert_eq!(sim.readdir_calls(), 3);

    // Resuming in the middle of a chunk finds the chunk that covers the position.
    let mid = cache.get_chunk(dir, None, children[5]).await.unwrap();
    assert_eq!(mid.entries_after(children[5])[0].id, children[6]);
    assert_eq!(sim.readdir_calls(), 3);
    cache.release_chunk(mid.id());
    cache.release(dir);
}

#[tokio::test]
async fn listed_objects_are_indexed_cold_without_references() {
    let sim = SimBackend::new();
    let (dir_id, children) = make_dir(&sim, "d", 4);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();

    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
    for dirent in chunk.dirents() {
        let eid = dirent.entry.unwrap();
        let info = cache.inspect(eid).unwrap();
        assert_eq!(info.state, EntryState::Unreferenced);
        assert_eq!(info.queue, QueueKind::Cold);
        assert_eq!(cache.identity(eid).unwrap(), dirent.id);
    }
    assert_eq!(sim.getattr_calls(), 1, "listing attributes come from readdir");

    // A later lookup of a listed object is a hit.
    let child = cache.lookup_or_populate(children[0]).await.unwrap();
    assert_eq!(Some(child), chunk.dirents()[0].entry);
    assert_eq!(sim.getattr_calls(), 1);
    cache.release(child);
    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn cookie_round_trip() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 4);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();

    let cookie = cache.map_dirent(chunk.id(), 2).unwrap();
    assert!(cookie >= FIRST_COOKIE);
    let mapped = cache.unmap_dirent(cookie).unwrap();
    assert_eq!(mapped.chunk, chunk.id());
    assert_eq!(mapped.index, 2);
    assert_eq!(mapped.parent, dir);
    assert_eq!(mapped.dirent.id, chunk.dirents()[2].id);
    assert_eq!(mapped.dirent.name, chunk.dirents()[2].name);

    // A dirent keeps its cookie; other dirents get their own.
    assert_eq!(cache.map_dirent(chunk.id(), 2).unwrap(), cookie);
    let other = cache.map_dirent(chunk.id(), 1).unwrap();
    assert_ne!(other, cookie);
    assert_eq!(cache.cookies_live(), 2);

    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn mapping_a_missing_slot_is_stale() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 3);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();

    assert!(matches!(
        cache.map_dirent(chunk.id(), 3),
        Err(CacheError::Stale)
    ));
    assert_eq!(cache.cookies_live(), 0);
    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn unknown_cookie_has_expired() {
    let sim = SimBackend::new();
    let cache = start(&sim, chunked_config());

    let err = cache.unmap_dirent(12_345).unwrap_err();
    assert!(matches!(err, CacheError::Expired(12_345)));
    assert_eq!(err.errno(), libc::EINVAL);
}

#[tokio::test]
async fn killing_the_directory_frees_chunks_and_expires_cookies() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 4);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
    let cookie = cache.map_dirent(chunk.id(), 0).unwrap();

    cache.kill(dir);
    assert_eq!(cache.stats().chunks_used, 0);
    assert_eq!(cache.cookies_live(), 0);
    assert!(matches!(
        cache.unmap_dirent(cookie),
        Err(CacheError::Expired(c)) if c == cookie
    ));

    // The caller's chunk reference outlived the chunk; handing it back is harmless.
    cache.release_chunk(chunk.id());
    assert!(matches!(
        cache.get_chunk(dir, None, 0).await,
        Err(CacheError::Stale)
    ));
    assert!(matches!(
        cache.map_dirent(chunk.id(), 0),
        Err(CacheError::Stale)
    ));
    cache.release(dir);
}

#[tokio::test]
async fn reclaiming_the_directory_frees_its_chunks() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    walk(&cache, dir).await;
    cache.release(dir);

    // The directory and its ten children are all reclaimable.
    assert_eq!(cache.release_entries(100), 11);
    assert_eq!(cache.stats().chunks_used, 0);
    assert_eq!(cache.stats().entries_used, 0);
}

#[tokio::test]
async fn held_chunk_keeps_its_directory_resident() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 3);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
    cache.release(dir);

    // Only the three listed children can go while the chunk is held.
    assert_eq!(cache.release_entries(1_000), 3);
    assert_eq!(cache.state(dir).unwrap(), EntryState::Unreferenced);
    assert_eq!(cache.stats().chunks_used, 1);
    let cookie = cache.map_dirent(chunk.id(), 0).unwrap();
    assert_eq!(cache.unmap_dirent(cookie).unwrap().parent, dir);

    cache.release_chunk(chunk.id());
    assert_eq!(cache.release_entries(1_000), 1);
    assert_eq!(cache.stats().chunks_used, 0);
    assert!(matches!(
        cache.unmap_dirent(cookie),
        Err(CacheError::Expired(_))
    ));
}

#[tokio::test]
async fn chunk_watermark_pass_trims_to_lowat() {
    let sim = SimBackend::new();
    let dirs: Vec<u64> = (0..5)
        .map(|d| make_dir(&sim, &format!("d{d}"), 2).0)
        .collect();
    let config = LruConfig {
        chunks_hiwat: 4,
        chunks_lowat: 1,
        ..chunked_config()
    };
    let cache = start(&sim, config);

    // Hold every chunk so the allocation-time eviction has nothing to take.
    let mut held = Vec::new();
    let mut cookies = Vec::new();
    for id in &dirs {
        let dir = cache.lookup_or_populate(*id).await.unwrap();
        let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
        cookies.push(cache.map_dirent(chunk.id(), 0).unwrap());
        held.push((dir, chunk.id()));
    }
    assert_eq!(cache.stats().chunks_used, 5);
    assert_eq!(cache.run_reclaim_pass().chunks, 0, "referenced chunks stay");

    for (_, chunk) in &held {
        cache.release_chunk(*chunk);
    }
    let report = cache.run_reclaim_pass();
    assert_eq!(report.chunks, 4);
    assert_eq!(cache.stats().chunks_used, 1);
    assert_eq!(cache.stats().chunks_reclaimed, 4);

    let live = cookies
        .iter()
        .filter(|c| cache.unmap_dirent(**c).is_ok())
        .count();
    assert_eq!(live, 1, "cookies of evicted chunks expire");
    assert_eq!(cache.cookies_live(), 1);

    for (dir, _) in held {
        cache.release(dir);
    }
}

#[tokio::test]
async fn cookie_map_is_capped() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 8);
    let config = LruConfig {
        dirmap_hiwat: 4,
        ..chunked_config()
    };
    let cache = start(&sim, config);
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let first = cache.get_chunk(dir, None, 0).await.unwrap();
    let second = cache
        .get_chunk(dir, None, first.next_whence().unwrap())
        .await
        .unwrap();

    let mut cookies: Vec<u64> = (0..4)
        .map(|i| cache.map_dirent(first.id(), i).unwrap())
        .collect();
    cookies.extend((0..2).map(|i| cache.map_dirent(second.id(), i).unwrap()));
    assert_eq!(cache.cookies_live(), 4);
    assert!(matches!(
        cache.unmap_dirent(cookies[0]),
        Err(CacheError::Expired(_))
    ));
    assert!(matches!(
        cache.unmap_dirent(cookies[1]),
        Err(CacheError::Expired(_))
    ));
    assert_eq!(cache.unmap_dirent(cookies[5]).unwrap().index, 1);

    // Mapping an aged-out dirent again brings back the same cookie.
    assert_eq!(cache.map_dirent(first.id(), 0).unwrap(), cookies[0]);
    assert_eq!(cache.unmap_dirent(cookies[0]).unwrap().index, 0);
    assert_eq!(cache.cookies_live(), 4);

    cache.release_chunk(first.id());
    cache.release_chunk(second.id());
    cache.release(dir);
}

#[tokio::test]
async fn remapping_a_dirent_keeps_its_cookie() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 4);
    let config = LruConfig {
        dirmap_hiwat: 4,
        ..chunked_config()
    };
    let cache = start(&sim, config);
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();

    let cookie = cache.map_dirent(chunk.id(), 0).unwrap();
    for _ in 0..100 {
        assert_eq!(cache.map_dirent(chunk.id(), 0).unwrap(), cookie);
    }
    assert_eq!(cache.cookies_live(), 1);
    let mapped = cache.unmap_dirent(cookie).unwrap();
    assert_eq!(mapped.index, 0);
    assert_eq!(mapped.dirent.id, chunk.dirents()[0].id);

    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn resolving_a_cookie_keeps_it_alive() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 4);
    let config = LruConfig {
        dirmap_hiwat: 3,
        ..chunked_config()
    };
    let cache = start(&sim, config);
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();

    let c1 = cache.map_dirent(chunk.id(), 0).unwrap();
    let c2 = cache.map_dirent(chunk.id(), 1).unwrap();
    let _c3 = cache.map_dirent(chunk.id(), 2).unwrap();
    cache.unmap_dirent(c1).unwrap();
    let _c4 = cache.map_dirent(chunk.id(), 3).unwrap();

    assert!(cache.unmap_dirent(c1).is_ok());
    assert!(matches!(
        cache.unmap_dirent(c2),
        Err(CacheError::Expired(_))
    ));

    cache.release_chunk(chunk.id());
    cache.release(dir);
}

#[tokio::test]
async fn resuming_from_a_cookie_reuses_the_resident_chunk() {
    let sim = SimBackend::new();
    let (dir_id, children) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();
    let cookie = cache.map_dirent(chunk.id(), 1).unwrap();
    cache.release_chunk(chunk.id());

    let mapped = cache.unmap_dirent(cookie).unwrap();
    let resumed = cache
        .get_chunk(mapped.parent, None, mapped.dirent.cookie)
        .await
        .unwrap();
    assert_eq!(resumed.id(), chunk.id());
    assert_eq!(resumed.entries_after(mapped.dirent.cookie)[0].id, children[2]);
    assert_eq!(sim.readdir_calls(), 1);

    cache.release_chunk(resumed.id());
    cache.release(dir);
}

#[tokio::test]
async fn non_directory_has_no_chunks() {
    let sim = SimBackend::new();
    let ids = make_files(&sim, 1);
    let cache = start(&sim, chunked_config());
    let file = cache.lookup_or_populate(ids[0]).await.unwrap();

    let err = cache.get_chunk(file, None, 0).await.unwrap_err();
    assert!(matches!(err, CacheError::NotADirectory));
    assert_eq!(err.errno(), libc::ENOTDIR);
    assert_eq!(sim.readdir_calls(), 0);
    cache.release(file);
}

#[tokio::test]
async fn readdir_error_keeps_the_previous_chunk() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 10);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let first = cache.get_chunk(dir, None, 0).await.unwrap();

    sim.inject(dir_id, Fault::Errno(libc::EIO));
    let whence = first.next_whence().unwrap();
    let err = cache.get_chunk(dir, Some(first.id()), whence).await.unwrap_err();
    assert_eq!(err.errno(), libc::EIO);
    assert_eq!(cache.stats().chunks_used, 1);

    // The caller still owns its reference on the first chunk.
    sim.clear_fault(dir_id);
    let second = cache.get_chunk(dir, Some(first.id()), whence).await.unwrap();
    assert_ne!(second.id(), first.id());
    cache.release_chunk(second.id());
    assert_eq!(cache.run_reclaim_pass().chunks, 0);
    cache.release(dir);
}

#[cfg(debug_assertions)]
#[tokio::test]
#[should_panic(expected = "reference discipline violated")]
async fn chunk_release_without_reference_panics_in_debug() {
    let sim = SimBackend::new();
    let (dir_id, _) = make_dir(&sim, "d", 2);
    let cache = start(&sim, chunked_config());
    let dir = cache.lookup_or_populate(dir_id).await.unwrap();
    let chunk = cache.get_chunk(dir, None, 0).await.unwrap();

    cache.release_chunk(chunk.id());
    cache.release_chunk(chunk.id());
}
