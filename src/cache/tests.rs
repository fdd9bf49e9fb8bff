use crate::arch::X86_64;
use crate::cache::{
    CacheConfig, CacheHandle, CacheKey, CachePolicy, CacheStats, CacheUnavailable, Script,
    ScriptCache, SCRIPT_CAPACITY,
};
use crate::dwarf::state::{CfaRule, RegisterRule, StateRecord};
use crate::dynamic::Predicates;
use crate::space::ProcInfo;

fn key(ip: u64) -> CacheKey {
    CacheKey {
        ip,
        predicates: Predicates::default(),
    }
}

fn script(offset: i64) -> Script {
    let mut state = StateRecord::new(&X86_64, 16);
    state.current.cfa = CfaRule::RegisterOffset {
        register: 7,
        offset,
    };
    state.current.set(16, RegisterRule::CfaRelative(-8)).unwrap();
    Script::compile(&state).unwrap()
}

fn insert(cache: &mut ScriptCache, ip: u64) -> u16 {
    cache.insert(key(ip), script(ip as i64), ProcInfo::default())
}

fn cached_offset(cache: &mut ScriptCache, ip: u64) -> Option<i64> {
    let (_, entry) = cache.lookup(&key(ip), None)?;
    match entry.script.cfa {
        CfaRule::RegisterOffset { offset, .. } => Some(offset),
        CfaRule::Expression(_) => None,
    }
}

#[test]
fn compile_keeps_explicit_rules_only() {
    let script = script(8);
    assert_eq!(script.rules.as_slice(), &[(16, RegisterRule::CfaRelative(-8))]);
    assert_eq!(script.return_address_column, 16);

    let mut state = StateRecord::new(&X86_64, 16);
    for reg in 0..=SCRIPT_CAPACITY as u64 {
        state.current.set(reg, RegisterRule::Undefined).unwrap();
    }
    assert!(Script::compile(&state).is_none());
}

#[test]
fn hits_return_what_was_stored() {
    let mut cache = ScriptCache::new(8);
    for ip in 0x1000..0x1008 {
        insert(&mut cache, ip);
    }
    for ip in 0x1000..0x1008 {
        assert_eq!(cached_offset(&mut cache, ip), Some(ip as i64));
    }
    assert_eq!(cached_offset(&mut cache, 0x2000), None);
    assert_eq!(cache.len(), 8);
    assert_eq!(
        cache.stats(),
        CacheStats {
            hits: 8,
            misses: 1,
            evictions: 0,
            flushes: 0
        }
    );
}

#[test]
fn one_past_capacity_evicts_the_least_recently_used() {
    let mut cache = ScriptCache::new(4);
    for ip in [0x10, 0x20, 0x30, 0x40] {
        insert(&mut cache, ip);
    }
    // 0x10 is now the most recent; 0x20 is the oldest.
    assert!(cached_offset(&mut cache, 0x10).is_some());
    insert(&mut cache, 0x50);

    assert_eq!(cached_offset(&mut cache, 0x20), None);
    for ip in [0x10, 0x30, 0x40, 0x50] {
        assert!(cached_offset(&mut cache, ip).is_some(), "{ip:#x}");
    }
    assert_eq!(cache.stats().evictions, 1);
    assert_eq!(cache.len(), 4);
}

#[test]
fn reinserting_a_key_replaces_in_place() {
    let mut cache = ScriptCache::new(2);
    let slot = insert(&mut cache, 0x10);
    let again = cache.insert(key(0x10), script(99), ProcInfo::default());
    assert_eq!(slot, again);
    assert_eq!(cached_offset(&mut cache, 0x10), Some(99));
    assert_eq!(cache.len(), 1);
}

#[test]
fn hint_and_predicates() {
    let mut cache = ScriptCache::new(16);
    let slot = insert(&mut cache, 0x1234);
    let (hit, _) = cache.lookup(&key(0x1234), Some(slot)).unwrap();
    assert_eq!(hit, slot);
    // a stale hint falls back to the bucket walk
    let (hit, _) = cache.lookup(&key(0x1234), Some(slot + 1)).unwrap();
    assert_eq!(hit, slot);

    let other = CacheKey {
        ip: 0x1234,
        predicates: Predicates { mask: 1, value: 1 },
    };
    assert!(cache.lookup(&other, Some(slot)).is_none());
}

#[test]
fn chains_survive_heavy_churn() {
    let mut cache = ScriptCache::new(3);
    for round in 0..50u64 {
        let ip = 0x4000 + round * 0x40;
        insert(&mut cache, ip);
        assert_eq!(cached_offset(&mut cache, ip), Some(ip as i64));
        if round >= 3 {
            assert_eq!(cached_offset(&mut cache, ip - 3 * 0x40), None);
        }
    }
    assert_eq!(cache.len(), 3);
}

#[test]
fn generation_change_flushes() {
    let mut cache = ScriptCache::new(4);
    insert(&mut cache, 0x10);
    cache.sync(0);
    assert!(cached_offset(&mut cache, 0x10).is_some());
    cache.sync(1);
    assert!(cache.is_empty());
    assert_eq!(cache.generation(), 1);
    assert_eq!(cache.stats().flushes, 1);
    cache.sync(1);
    assert_eq!(cache.stats().flushes, 1);
}

#[test]
fn capacity_is_clamped() {
    assert_eq!(ScriptCache::new(0).capacity(), 1);
    let mut cache = ScriptCache::new(1);
    insert(&mut cache, 1);
    insert(&mut cache, 2);
    assert_eq!(cached_offset(&mut cache, 1), None);
    assert!(cached_offset(&mut cache, 2).is_some());
}

#[test]
fn policies() {
    let none = CacheHandle::new(CacheConfig {
        policy: CachePolicy::None,
        capacity: 8,
    });
    assert_eq!(none.with(|_| ()), Err(CacheUnavailable));

    let global = CacheHandle::new(CacheConfig::default());
    assert_eq!(global.with(|cache| cache.capacity()), Ok(128));
    // re-entrant use does not block
    let nested = global.with(|_| global.with(|_| ()));
    assert_eq!(nested, Ok(Err(CacheUnavailable)));
}

#[cfg(feature = "std")]
#[test]
fn per_thread_caches_are_separate() {
    let handle = CacheHandle::new(CacheConfig {
        policy: CachePolicy::PerThread,
        capacity: 4,
    });
    handle
        .with(|cache| {
            insert(cache, 0x10);
        })
        .unwrap();
    assert_eq!(handle.with(|cache| cache.len()), Ok(1));

    std::thread::scope(|s| {
        s.spawn(|| assert_eq!(handle.with(|cache| cache.len()), Ok(0)));
    });

    let nested = handle.with(|_| handle.with(|_| ()));
    assert_eq!(nested, Ok(Err(CacheUnavailable)));
}
