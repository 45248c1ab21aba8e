// Storage-layer tests for the episode store
// Run with: cargo test --package podcast-kb --lib database::tests

#[cfg(test)]
mod episode_tests {
    use crate::database::{
        Database, NewEpisode, SourceStatus, StatusUpdate, TranscriptOrigin, TranscriptWord,
    };
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Duration;
    use tempfile::TempDir;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn setup_test_db() -> (Database, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("test.db");
        let db = Database::new(&db_path).unwrap();
        (db, temp_dir)
    }

    fn new_episode(guid: &str, title: &str) -> NewEpisode {
        NewEpisode {
            source_id: "main".to_string(),
            guid: guid.to_string(),
            title: title.to_string(),
            published_date: Some(format!("2024-01-{:02}T00:00:00Z", guid.len())),
            ..Default::default()
        }
    }

    fn with_item(mut ep: NewEpisode, item_id: i64) -> NewEpisode {
        ep.source_item_id = Some(item_id);
        ep
    }

    fn words() -> Vec<TranscriptWord> {
        vec![
            TranscriptWord {
                word: "hello".into(),
                start: 0.0,
                end: 0.4,
                speaker: Some("A".into()),
                confidence: Some(0.98),
            },
            TranscriptWord {
                word: "world".into(),
                start: 0.4,
                end: 0.9,
                speaker: Some("A".into()),
                confidence: None,
            },
        ]
    }

    // =========================================================================
    // Upsert
    // =========================================================================

    #[test]
    fn test_upsert_counts_new_and_updated() {
        let (db, _temp) = setup_test_db();
        let (added, updated) = db
            .upsert_episodes(&[new_episode("a", "First"), new_episode("b", "Second")])
            .unwrap();
        assert_eq!((added, updated), (2, 0));

        let (added, updated) = db
            .upsert_episodes(&[new_episode("a", "First"), new_episode("c", "Third")])
            .unwrap();
        assert_eq!((added, updated), (1, 1));
        assert_eq!(db.get_episodes_for_source("main").unwrap().len(), 3);
    }

    #[test]
    fn test_upsert_same_identity_updates_without_duplicate() {
        let (db, _temp) = setup_test_db();
        let mut ep = new_episode("a", "Old title");
        ep.description = Some("old description".into());
        db.upsert_episodes(&[ep]).unwrap();

        let mut ep = new_episode("a", "New title");
        ep.audio_url = Some("https://cdn.example.com/a.mp3".into());
        db.upsert_episodes(&[ep]).unwrap();

        let all = db.get_episodes_for_source("main").unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "New title");
        // COALESCE keeps the earlier description
        assert_eq!(all[0].description.as_deref(), Some("old description"));
        assert_eq!(all[0].audio_url.as_deref(), Some("https://cdn.example.com/a.mp3"));
    }

    #[test]
    fn test_same_guid_in_different_sources_is_distinct() {
        let (db, _temp) = setup_test_db();
        let mut other = new_episode("a", "Other feed");
        other.source_id = "bonus".into();
        let (added, _) = db.upsert_episodes(&[new_episode("a", "Main"), other]).unwrap();
        assert_eq!(added, 2);
    }

    #[test]
    fn test_reupsert_never_erases_transcript() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[new_episode("a", "Ep")]).unwrap();
        db.set_transcript("main", "a", "the words", TranscriptOrigin::Service, Some(&words()))
            .unwrap();

        db.upsert_episodes(&[new_episode("a", "Ep (remastered)")]).unwrap();

        let ep = db.get_episode("main", "a").unwrap().unwrap();
        assert_eq!(ep.transcript_text.as_deref(), Some("the words"));
        assert!(ep.has_transcript_data);
        assert_eq!(ep.title, "Ep (remastered)");
    }

    #[test]
    fn test_reupsert_keeps_item_id_and_exclusion_tag() {
        let (db, _temp) = setup_test_db();
        let mut ep = with_item(new_episode("a", "Ep"), 77);
        ep.exclusion_tag = Some("promo".into());
        db.upsert_episodes(&[ep]).unwrap();

        db.upsert_episodes(&[new_episode("a", "Ep")]).unwrap();

        let ep = db.get_episode("main", "a").unwrap().unwrap();
        assert_eq!(ep.source_item_id, Some(77));
        assert_eq!(ep.exclusion_tag.as_deref(), Some("promo"));
    }

    #[test]
    fn test_upsert_special_characters() {
        let (db, _temp) = setup_test_db();
        let titles = [
            "O'Brien's Episode",
            "Quotes \"here\"",
            "Drop; DROP TABLE episodes;--",
            "Señor 日本語 🎉",
        ];
        for (i, title) in titles.iter().enumerate() {
            let result = db.upsert_episodes(&[new_episode(&format!("g{}", i), title)]);
            assert!(result.is_ok(), "Failed for title: {}", title);
        }
        assert_eq!(db.get_episodes_for_source("main").unwrap().len(), titles.len());
    }

    // =========================================================================
    // Status cache and cooldown
    // =========================================================================

    #[test]
    fn test_missing_transcript_respects_cooldown() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[
            with_item(new_episode("fresh", "Checked an hour ago"), 1),
            with_item(new_episode("stale", "Checked two days ago"), 2),
            with_item(new_episode("never", "Never checked"), 3),
        ])
        .unwrap();

        let update = |guid: &str| StatusUpdate {
            source_id: "main".into(),
            guid: guid.into(),
            status: SourceStatus::Running,
            transcription_id: None,
        };
        db.set_statuses_at(&[update("fresh")], Utc::now() - ChronoDuration::hours(1))
            .unwrap();
        db.set_statuses_at(&[update("stale")], Utc::now() - ChronoDuration::days(2))
            .unwrap();

        let candidates = db.get_episodes_missing_transcript("main", None, DAY).unwrap();
        let mut guids: Vec<&str> = candidates.iter().map(|e| e.guid.as_str()).collect();
        guids.sort();
        assert_eq!(guids, vec!["never", "stale"]);

        // A zero cooldown lets everything through again
        let all = db
            .get_episodes_missing_transcript("main", None, Duration::ZERO)
            .unwrap();
        assert_eq!(all.len(), 3);
    }

    #[test]
    fn test_missing_transcript_excludes_tagged_and_transcribed() {
        let (db, _temp) = setup_test_db();
        let mut tagged = new_episode("tagged", "Sponsor spot");
        tagged.exclusion_tag = Some("promo".into());
        db.upsert_episodes(&[tagged, new_episode("done", "Has text"), new_episode("open", "Open")])
            .unwrap();
        db.set_transcript("main", "done", "text", TranscriptOrigin::FeedLink, None)
            .unwrap();

        let candidates = db.get_episodes_missing_transcript("main", Some(10), DAY).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].guid, "open");
    }

    #[test]
    fn test_missing_transcript_limit() {
        let (db, _temp) = setup_test_db();
        let eps: Vec<NewEpisode> = (0..5)
            .map(|i| new_episode(&format!("g{}", i), &format!("Ep {}", i)))
            .collect();
        db.upsert_episodes(&eps).unwrap();
        let limited = db.get_episodes_missing_transcript("main", Some(2), DAY).unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn test_set_statuses_keeps_transcription_id_when_absent() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[with_item(new_episode("a", "Ep"), 5)]).unwrap();
        db.set_statuses(&[StatusUpdate {
            source_id: "main".into(),
            guid: "a".into(),
            status: SourceStatus::Done,
            transcription_id: Some("tx-1".into()),
        }])
        .unwrap();
        db.set_statuses(&[StatusUpdate {
            source_id: "main".into(),
            guid: "a".into(),
            status: SourceStatus::Requested,
            transcription_id: None,
        }])
        .unwrap();

        let ep = db.get_episode("main", "a").unwrap().unwrap();
        assert_eq!(ep.source_status, Some(SourceStatus::Requested));
        assert_eq!(ep.transcription_id.as_deref(), Some("tx-1"));
        assert!(ep.status_checked_at.is_some());
    }

    // =========================================================================
    // Queue candidate queries
    // =========================================================================

    #[test]
    fn test_needing_request_filters() {
        let (db, _temp) = setup_test_db();
        let mut tagged = with_item(new_episode("tagged", "Promo"), 4);
        tagged.exclusion_tag = Some("promo".into());
        db.upsert_episodes(&[
            with_item(new_episode("untouched", "No status"), 1),
            with_item(new_episode("notstarted", "Not started"), 2),
            with_item(new_episode("running", "Running"), 3),
            tagged,
            new_episode("noid", "No external id"),
        ])
        .unwrap();
        db.set_statuses(&[
            StatusUpdate {
                source_id: "main".into(),
                guid: "notstarted".into(),
                status: SourceStatus::NotStarted,
                transcription_id: None,
            },
            StatusUpdate {
                source_id: "main".into(),
                guid: "running".into(),
                status: SourceStatus::Running,
                transcription_id: None,
            },
        ])
        .unwrap();

        let mut guids: Vec<String> = db
            .get_episodes_needing_request(None, None)
            .unwrap()
            .into_iter()
            .map(|e| e.guid)
            .collect();
        guids.sort();
        assert_eq!(guids, vec!["notstarted", "untouched"]);

        let limited = db.get_episodes_needing_request(None, Some(1)).unwrap();
        assert_eq!(limited.len(), 1);

        let other_source = db
            .get_episodes_needing_request(Some(&["bonus".to_string()]), None)
            .unwrap();
        assert!(other_source.is_empty());
    }

    #[test]
    fn test_in_processing_includes_done_without_text() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[
            with_item(new_episode("req", "Requested"), 1),
            with_item(new_episode("bogus", "Done but empty"), 2),
            with_item(new_episode("real", "Done with text"), 3),
            with_item(new_episode("ns", "Not started"), 4),
        ])
        .unwrap();
        let status = |guid: &str, status| StatusUpdate {
            source_id: "main".into(),
            guid: guid.into(),
            status,
            transcription_id: None,
        };
        db.set_statuses(&[
            status("req", SourceStatus::Requested),
            status("bogus", SourceStatus::Done),
            status("real", SourceStatus::Done),
            status("ns", SourceStatus::NotStarted),
        ])
        .unwrap();
        db.set_transcript("main", "real", "text", TranscriptOrigin::Service, None)
            .unwrap();

        let mut guids: Vec<String> = db
            .get_episodes_in_processing(Some(&["main".to_string()]))
            .unwrap()
            .into_iter()
            .map(|e| e.guid)
            .collect();
        guids.sort();
        assert_eq!(guids, vec!["bogus", "req"]);
    }

    #[test]
    fn test_enrichment_candidates_and_data_write() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[
            with_item(new_episode("plain", "Plain text only"), 1),
            with_item(new_episode("rich", "Has words"), 2),
            with_item(new_episode("none", "No transcript"), 3),
        ])
        .unwrap();
        db.set_transcript("main", "plain", "plain text", TranscriptOrigin::FeedLink, None)
            .unwrap();
        db.set_transcript("main", "rich", "rich text", TranscriptOrigin::Service, Some(&words()))
            .unwrap();

        let candidates = db.get_episodes_needing_enrichment(None, None).unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].guid, "plain");

        assert!(db.set_transcript_data(candidates[0].id, &words()).unwrap());
        let stored = db.get_transcript(candidates[0].id).unwrap().unwrap();
        assert_eq!(stored.full_text, "plain text");
        assert_eq!(stored.words.unwrap().len(), 2);
        assert!(db.get_episodes_needing_enrichment(None, None).unwrap().is_empty());
    }

    #[test]
    fn test_set_transcript_unknown_episode() {
        let (db, _temp) = setup_test_db();
        let written = db
            .set_transcript("main", "missing", "text", TranscriptOrigin::Service, None)
            .unwrap();
        assert!(!written);
    }

    #[test]
    fn test_source_summary() {
        let (db, _temp) = setup_test_db();
        let mut tagged = new_episode("tagged", "Promo");
        tagged.exclusion_tag = Some("promo".into());
        db.upsert_episodes(&[
            with_item(new_episode("a", "A"), 1),
            with_item(new_episode("b", "B"), 2),
            tagged,
        ])
        .unwrap();
        db.set_transcript("main", "a", "text", TranscriptOrigin::Service, None)
            .unwrap();
        db.set_statuses(&[StatusUpdate {
            source_id: "main".into(),
            guid: "b".into(),
            status: SourceStatus::Requested,
            transcription_id: None,
        }])
        .unwrap();

        let summary = db.get_source_summary("main").unwrap();
        assert_eq!(summary.total, 3);
        assert_eq!(summary.with_transcript, 1);
        assert_eq!(summary.excluded, 1);
        assert_eq!(summary.without_item_id, 1);
        assert_eq!(summary.in_processing, 1);
        assert_eq!(summary.needing_request, 0);
    }

    #[test]
    fn test_count_by_status() {
        let (db, _temp) = setup_test_db();
        db.upsert_episodes(&[
            with_item(new_episode("a", "A"), 1),
            with_item(new_episode("b", "B"), 2),
            with_item(new_episode("c", "C"), 3),
        ])
        .unwrap();
        let update = |guid: &str, status| StatusUpdate {
            source_id: "main".into(),
            guid: guid.into(),
            status,
            transcription_id: None,
        };
        db.set_statuses(&[update("a", SourceStatus::Running), update("b", SourceStatus::Running)])
            .unwrap();

        let counts = db.count_by_status("main").unwrap();
        assert_eq!(counts, vec![("running".to_string(), 2), ("unchecked".to_string(), 1)]);
        assert!(db.count_by_status("nobody").unwrap().is_empty());
    }

    #[test]
    fn test_settings_roundtrip() {
        let (db, _temp) = setup_test_db();
        assert_eq!(db.get_setting("service_credential").unwrap(), None);
        db.set_setting("service_credential", "abc").unwrap();
        db.set_setting("service_credential", "def").unwrap();
        assert_eq!(db.get_setting("service_credential").unwrap().as_deref(), Some("def"));
    }
}
