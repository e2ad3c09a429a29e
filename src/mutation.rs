//! Optimistic mutation protocol.
//!
//! Every resource accessor applies the same sequence: snapshot the local
//! collection, splice in the proposed change immediately, issue the remote
//! mutation, then either commit the server's authoritative result or restore
//! the snapshot exactly. The protocol is factored here once instead of being
//! repeated per resource.
//!
//! The snapshot, the proposed change, and the remote operation together form
//! the per-call mutation context; nothing is persisted. If the remote call
//! fails the collection is byte-for-byte what it was before the call — there
//! is no partial rollback.

use std::future::Future;

use parking_lot::Mutex;
use tracing::warn;

use crate::error::MutationError;

/// Run one optimistic mutation against `collection`.
///
/// 1. `apply` makes the provisional local change under the lock.
/// 2. `remote` is awaited without holding the lock.
/// 3. On success, `commit` replaces the provisional change with the server's
///    authoritative value; on failure, the pre-mutation snapshot is restored
///    exactly and the error is returned.
///
/// Input validation belongs *before* this call: a validation failure must
/// not reach the network nor touch the collection.
///
/// # Examples
///
/// ```rust
/// use parking_lot::Mutex;
/// use turma_client::error::MutationError;
/// use turma_client::mutation::with_optimistic_update;
///
/// # async fn demo() -> Result<(), MutationError> {
/// let roster: Mutex<Vec<String>> = Mutex::new(vec!["ana".to_string()]);
///
/// let committed = with_optimistic_update(
///     &roster,
///     |list| list.push("tmp-bruno".to_string()),
///     async { Ok::<_, MutationError>("bruno".to_string()) },
///     |list, accepted| {
///         if let Some(slot) = list.iter_mut().find(|n| *n == "tmp-bruno") {
///             *slot = accepted.clone();
///         }
///     },
/// )
/// .await?;
/// assert_eq!(committed, "bruno");
/// # Ok(())
/// # }
/// ```
pub async fn with_optimistic_update<C, T, A, F, U>(
    collection: &Mutex<C>,
    apply: A,
    remote: F,
    commit: U,
) -> Result<T, MutationError>
where
    C: Clone,
    A: FnOnce(&mut C),
    F: Future<Output = Result<T, MutationError>>,
    U: FnOnce(&mut C, &T),
{
    let snapshot = {
        let mut guard = collection.lock();
        let snapshot = guard.clone();
        apply(&mut guard);
        snapshot
    };

    match remote.await {
        Ok(value) => {
            let mut guard = collection.lock();
            commit(&mut guard, &value);
            Ok(value)
        }
        Err(err) => {
            warn!(error = %err, "remote mutation failed; rolling back optimistic change");
            *collection.lock() = snapshot;
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[tokio::test]
    async fn success_commits_authoritative_value() {
        let list: Mutex<Vec<String>> = Mutex::new(vec!["a".to_string()]);

        let result = with_optimistic_update(
            &list,
            |items| items.insert(0, "tmp-1".to_string()),
            async { Ok::<_, MutationError>("server-1".to_string()) },
            |items, accepted| {
                if let Some(slot) = items.iter_mut().find(|item| *item == "tmp-1") {
                    *slot = accepted.clone();
                }
            },
        )
        .await;

        assert_eq!(result.unwrap(), "server-1");
        assert_eq!(*list.lock(), vec!["server-1".to_string(), "a".to_string()]);
    }

    #[tokio::test]
    async fn failure_restores_snapshot_exactly() {
        let original = vec!["a".to_string(), "b".to_string()];
        let list = Mutex::new(original.clone());

        let result = with_optimistic_update(
            &list,
            |items| {
                items.remove(0);
                items.push("tmp".to_string());
            },
            async { Err::<String, _>(MutationError::remote("rejected")) },
            |_, _| unreachable!("commit must not run on failure"),
        )
        .await;

        assert!(result.is_err());
        assert_eq!(*list.lock(), original);
    }

    #[tokio::test]
    async fn optimistic_change_is_visible_while_remote_is_pending() {
        let list: Mutex<Vec<i32>> = Mutex::new(vec![1]);
        let (tx, rx) = tokio::sync::oneshot::channel::<()>();

        let mutation = with_optimistic_update(
            &list,
            |items| items.push(2),
            async {
                rx.await.ok();
                Ok::<_, MutationError>(2)
            },
            |_, _| {},
        );
        tokio::pin!(mutation);

        // Poll once so the optimistic apply has run, then observe it.
        tokio::select! {
            biased;
            _ = &mut mutation => panic!("remote should still be pending"),
            _ = std::future::ready(()) => {}
        }
        assert_eq!(*list.lock(), vec![1, 2]);

        tx.send(()).ok();
        mutation.await.unwrap();
    }

    proptest! {
        #[test]
        fn rollback_restores_any_collection(original in proptest::collection::vec(any::<i32>(), 0..20), extra in any::<i32>()) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .build()
                .expect("runtime");
            runtime.block_on(async {
                let list = Mutex::new(original.clone());
                let result = with_optimistic_update(
                    &list,
                    |items: &mut Vec<i32>| {
                        items.push(extra);
                        items.reverse();
                    },
                    async { Err::<(), _>(MutationError::remote("always fails")) },
                    |_, _| {},
                )
                .await;
                prop_assert!(result.is_err());
                prop_assert_eq!(&*list.lock(), &original);
                Ok(())
            })?;
        }
    }
}
