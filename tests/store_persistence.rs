//! Integration tests for the encrypted record store's durability guarantees

use tempfile::TempDir;
use veilchain::error::ChainError;
use veilchain::store::RecordStore;

fn collect(store: &RecordStore) -> Vec<Vec<u8>> {
    let mut records = Vec::new();
    store
        .for_each(|data| records.push(data.to_vec()))
        .expect("iteration succeeds");
    records
}

#[test]
fn test_two_appends_survive_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("records.dat");

    {
        let store = RecordStore::open(&path)?;
        assert_eq!(store.count(), 0);
        store.append(b"x")?;
        store.append(b"y")?;
        assert_eq!(store.count(), 2);
        assert_eq!(collect(&store), vec![b"x".to_vec(), b"y".to_vec()]);
    }

    // reopening from disk reproduces the same records in the same order
    let reopened = RecordStore::open(&path)?;
    assert_eq!(reopened.count(), 2);
    assert_eq!(collect(&reopened), vec![b"x".to_vec(), b"y".to_vec()]);
    Ok(())
}

#[test]
fn test_many_appends_keep_order_and_positions() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("records.dat");
    let store = RecordStore::open(&path)?;

    let payloads: Vec<Vec<u8>> = (0..50)
        .map(|i| format!("record-{:03}", i).into_bytes())
        .collect();
    for payload in &payloads {
        store.append(payload)?;
    }

    assert_eq!(store.count(), payloads.len() as i64);
    assert_eq!(collect(&store), payloads);

    // every payload seals to its length + the 16-byte tag
    let expected_total: i64 = payloads.iter().map(|p| p.len() as i64 + 16).sum();
    assert_eq!(store.total_encrypted_length(), expected_total);

    // the header's last-node offset is where the final append landed
    let last = store.last_node_position();
    assert_eq!(store.read_from(last)?, *payloads.last().unwrap());
    Ok(())
}

#[test]
fn test_cursor_walks_a_reopened_store() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("records.dat");

    {
        let store = RecordStore::open(&path)?;
        for payload in [&b"one"[..], b"two", b"three"] {
            store.append(payload)?;
        }
    }

    let store = RecordStore::open(&path)?;
    store.rewind()?;
    assert_eq!(store.next_record()?, b"one");
    assert_eq!(store.next_record()?, b"two");
    assert_eq!(store.next_record()?, b"three");
    assert_eq!(store.next_record().unwrap_err(), ChainError::EndOfChain);

    store.rewind()?;
    assert_eq!(store.next_record()?, b"one");
    Ok(())
}

#[test]
fn test_oversized_update_is_rejected_across_reopen() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let path = dir.path().join("records.dat");

    {
        let store = RecordStore::open(&path)?;
        store.append(b"fits")?;
        let err = store
            .update_matching(b"does not fit in the original span", |_| true)
            .unwrap_err();
        assert!(matches!(err, ChainError::PayloadTooLarge { .. }));
    }

    let store = RecordStore::open(&path)?;
    assert_eq!(collect(&store), vec![b"fits".to_vec()]);

    // a same-size replacement works and also survives a reopen
    store.update_matching(b"swap", |data| data == b"fits")?;
    drop(store);
    let store = RecordStore::open(&path)?;
    assert_eq!(collect(&store), vec![b"swap".to_vec()]);
    Ok(())
}

#[test]
fn test_find_first_through_encrypted_records() -> Result<(), Box<dyn std::error::Error>> {
    let dir = TempDir::new()?;
    let store = RecordStore::open(dir.path().join("records.dat"))?;

    for i in 0..10u8 {
        store.append(&[i; 4])?;
    }

    let found = store.find_first(|data| {
        if data[0] == 7 {
            Some(data.to_vec())
        } else {
            None
        }
    })?;
    assert_eq!(found, vec![7u8; 4]);

    assert_eq!(
        store.find_first(|_| None::<()>).unwrap_err(),
        ChainError::NotFound
    );
    Ok(())
}
