mod key_index_tests {
    use std::collections::HashSet;

    use osprey_common::error::MvccError;

    use crate::mvcc::{KeyIndex, Revision};

    /// put(1.0) put(2.0) tombstone(3.0) put(4.0) tombstone(5.0)
    fn sample_index() -> KeyIndex {
        let mut ki = KeyIndex::new(b"foo".to_vec());
        ki.put(1, 0);
        ki.put(2, 0);
        ki.tombstone(3, 0).unwrap();
        ki.put(4, 0);
        ki.tombstone(5, 0).unwrap();
        ki
    }

    #[test]
    fn test_put_tracks_modified() {
        let mut ki = KeyIndex::new(b"foo".to_vec());
        ki.put(5, 0);
        assert_eq!(ki.modified, Revision::new(5, 0));
        ki.put(5, 1);
        assert_eq!(ki.modified, Revision::new(5, 1));
        ki.put(7, 0);
        assert_eq!(ki.modified, Revision::new(7, 0));
    }

    #[test]
    #[should_panic]
    fn test_put_smaller_revision_panics() {
        let mut ki = KeyIndex::new(b"foo".to_vec());
        ki.put(5, 0);
        ki.put(4, 0);
    }

    #[test]
    fn test_tombstone_on_deleted_key() {
        let mut ki = KeyIndex::new(b"foo".to_vec());
        ki.put(1, 0);
        ki.tombstone(2, 0).unwrap();
        // the new generation is empty: a second tombstone has nothing to
        // delete
        assert_eq!(ki.tombstone(3, 0), Err(MvccError::RevisionNotFound));
    }

    #[test]
    fn test_get_time_travel_across_generations() {
        // spec history: put@2, put@4, tombstone@6, put@8
        let mut ki = KeyIndex::new(b"k".to_vec());
        ki.put(2, 0);
        ki.put(4, 0);
        ki.tombstone(6, 0).unwrap();
        ki.put(8, 0);

        // before creation
        assert_eq!(ki.get(1), Err(MvccError::RevisionNotFound));
        // within the first generation
        let (m, c, ver) = ki.get(2).unwrap();
        assert_eq!((m, c, ver), (Revision::new(2, 0), Revision::new(2, 0), 1));
        let (m, _, ver) = ki.get(5).unwrap();
        assert_eq!(m, Revision::new(4, 0));
        assert_eq!(ver, 2);
        // in the gap between tombstone and re-creation
        assert_eq!(ki.get(6), Err(MvccError::RevisionNotFound));
        assert_eq!(ki.get(7), Err(MvccError::RevisionNotFound));
        // after re-creation
        let (m, c, ver) = ki.get(8).unwrap();
        assert_eq!((m, c, ver), (Revision::new(8, 0), Revision::new(8, 0), 1));
        let (m, _, _) = ki.get(100).unwrap();
        assert_eq!(m, Revision::new(8, 0));
    }

    #[test]
    fn test_since() {
        let ki = sample_index();
        let all = ki.since(1);
        assert_eq!(
            all,
            vec![
                Revision::new(1, 0),
                Revision::new(2, 0),
                Revision::new(3, 0),
                Revision::new(4, 0),
                Revision::new(5, 0),
            ]
        );
        assert_eq!(ki.since(4), vec![Revision::new(4, 0), Revision::new(5, 0)]);
        assert!(ki.since(6).is_empty());
    }

    #[test]
    fn test_since_collapses_equal_main_revisions() {
        let mut ki = KeyIndex::new(b"k".to_vec());
        ki.put(3, 0);
        ki.put(3, 2);
        ki.put(5, 0);
        assert_eq!(ki.since(1), vec![Revision::new(3, 2), Revision::new(5, 0)]);
    }

    #[test]
    fn test_compact_walkthrough() {
        // mirrors the documented example on KeyIndex
        let mut ki = sample_index();
        let mut avail = HashSet::new();

        ki.compact(2, &mut avail);
        assert!(!ki.is_empty());
        let (m, _, _) = ki.get(2).unwrap();
        assert_eq!(m, Revision::new(2, 0));
        assert!(avail.contains(&Revision::new(2, 0)));

        // compact(4): the first generation is fully superseded
        let mut avail = HashSet::new();
        ki.compact(4, &mut avail);
        assert_eq!(ki.get(3), Err(MvccError::RevisionNotFound));
        let (m, _, _) = ki.get(4).unwrap();
        assert_eq!(m, Revision::new(4, 0));

        // compact(5): only the trailing tombstone survives, and a tombstone
        // outside the newest generation is dropped too
        let mut avail = HashSet::new();
        ki.compact(5, &mut avail);
        assert!(ki.is_empty(), "key index should now be removable");
        assert!(!avail.contains(&Revision::new(5, 0)));
    }

    #[test]
    fn test_compact_is_idempotent() {
        let mut a = sample_index();
        let mut b = sample_index();
        let mut avail = HashSet::new();
        a.compact(4, &mut avail);
        let snapshot = a.clone();
        let mut avail = HashSet::new();
        a.compact(4, &mut avail);
        assert_eq!(a, snapshot);

        // compact(r1); compact(r2) == compact(r2) for r1 < r2
        let mut avail = HashSet::new();
        b.compact(2, &mut avail);
        let mut avail = HashSet::new();
        b.compact(4, &mut avail);
        assert_eq!(a, b);
    }

    #[test]
    fn test_keep_does_not_mutate() {
        let ki = sample_index();
        let before = ki.clone();
        let mut avail = HashSet::new();
        ki.keep(4, &mut avail);
        assert_eq!(ki, before);
        assert!(avail.contains(&Revision::new(4, 0)));

        // the kept revision at a mid-history tombstone is not live
        let mut avail = HashSet::new();
        ki.keep(3, &mut avail);
        assert!(!avail.contains(&Revision::new(3, 0)));
    }

    #[test]
    fn test_restore() {
        let mut ki = KeyIndex::new(b"k".to_vec());
        ki.restore(Revision::new(2, 0), Revision::new(5, 1), 3);
        let (m, c, ver) = ki.get(6).unwrap();
        assert_eq!(m, Revision::new(5, 1));
        assert_eq!(c, Revision::new(2, 0));
        assert_eq!(ver, 3);
    }
}
