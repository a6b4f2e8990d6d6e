use otsync::ot::OTAlgorithms;
use otsync::ot::OTRepositoryStub;
use otsync::ot::OTStateManager;
use otsync::ot::StateError;
use otsync::ot::StubError;
use otsync::ot::StubOp;

mod util;
use util::*;

type Manager<'a> = OTStateManager<&'a OTRepositoryStub<TestOp>, TestOpSystem, TestState>;

async fn checked_out(repo: &OTRepositoryStub<TestOp>) -> Manager<'_> {
    let mut manager = OTStateManager::new(
        OTAlgorithms::new(repo, TestOpSystem),
        TestState::default(),
    );
    manager.checkout().await.expect("checkout");
    manager
}

#[tokio::test]
async fn concurrent_edits_converge() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut first = checked_out(&repo).await;
    let mut second = checked_out(&repo).await;

    first.add([add(10)]);
    second.add([add(10)]);
    first.commit_and_push().await.expect("push first");
    second.commit_and_push().await.expect("push second");
    assert_eq!(repo.heads_now().len(), 2);

    first.sync().await.expect("sync first");
    second.sync().await.expect("sync second");

    assert_eq!(first.state().value, 20);
    assert_eq!(second.state().value, 20);
    assert_eq!(repo.heads_now().len(), 1);
    assert_eq!(first.revision(), second.revision());
    assert!(!first.has_pending_commits());
}

#[tokio::test]
async fn uncommitted_work_is_rebased_on_sync() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut first = checked_out(&repo).await;
    let mut second = checked_out(&repo).await;

    first.add([add(10)]);
    second.add([add(10)]);
    first.sync().await.expect("sync first");
    second.sync().await.expect("sync second");
    first.sync().await.expect("sync first again");

    assert_eq!(first.state().value, 20);
    assert_eq!(second.state().value, 20);
    assert_eq!(repo.heads_now().len(), 1);
    assert_eq!(first.revision(), second.revision());
}

#[tokio::test]
async fn staged_syncs_reach_the_same_state() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut first = checked_out(&repo).await;
    let mut second = checked_out(&repo).await;

    first.add([add(40)]);
    second.add([add(50)]);
    first.commit_and_push().await.expect("push first");
    second.commit_and_push().await.expect("push second");

    first.sync().await.expect("sync first");
    assert_eq!(first.state().value, 90);

    second.add([add(10)]);
    assert_eq!(second.state().value, 60);
    second.sync().await.expect("sync second");
    assert_eq!(second.state().value, 100);

    first.sync().await.expect("sync first again");
    assert_eq!(first.state().value, 100);
    assert_eq!(first.revision(), second.revision());
    assert_eq!(repo.heads_now().len(), 1);
}

#[tokio::test]
async fn sequential_then_concurrent_edits_converge() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut first = checked_out(&repo).await;
    let mut second = checked_out(&repo).await;

    first.add([add(10)]);
    first.sync().await.expect("sync first");
    second.sync().await.expect("sync second");
    second.add([add(20)]);
    second.sync().await.expect("sync second");
    first.sync().await.expect("sync first");
    assert_eq!(first.state().value, 30);
    assert_eq!(first.revision(), second.revision());

    first.add([add(30)]);
    second.add([add(40)]);
    first.sync().await.expect("sync first");
    second.sync().await.expect("sync second");
    first.sync().await.expect("sync first again");

    assert_eq!(first.state().value, 100);
    assert_eq!(second.state().value, 100);
    assert_eq!(repo.heads_now().len(), 1);
    assert_eq!(first.revision(), second.revision());
}

#[tokio::test]
async fn concurrent_sets_pick_the_same_winner() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut first = checked_out(&repo).await;
    let mut second = checked_out(&repo).await;

    first.add([set(0, 3)]);
    second.add([set(0, 8)]);
    first.sync().await.expect("sync first");
    second.sync().await.expect("sync second");
    first.sync().await.expect("sync first again");

    assert_eq!(first.state().value, 8);
    assert_eq!(second.state().value, 8);
}

#[tokio::test]
async fn failed_push_keeps_commits_pending() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut manager = checked_out(&repo).await;

    manager.add([add(5)]);
    let id = manager
        .commit()
        .await
        .expect("commit")
        .expect("working diffs were committed");

    repo.fail_next(StubOp::Push);
    match manager.push().await {
        Err(StateError::Repository(StubError::Injected(StubOp::Push))) => {}
        other => panic!("expected injected push failure, got {other:?}"),
    }
    assert!(manager.has_pending_commits());
    assert!(!repo.heads_now().contains(&id));

    manager.push().await.expect("retry push");
    assert!(!manager.has_pending_commits());
    assert_eq!(repo.heads_now(), [id].into());
    assert_eq!(manager.state().value, 5);
}

#[tokio::test]
async fn failed_sync_can_be_retried() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut manager = checked_out(&repo).await;

    manager.add([add(7)]);
    repo.fail_next(StubOp::CreateCommit);
    assert!(manager.sync().await.is_err());
    assert_eq!(manager.working_diffs(), &[add(7)]);

    manager.sync().await.expect("sync");
    assert!(manager.working_diffs().is_empty());
    assert_eq!(repo.heads_now().len(), 1);
    assert_eq!(manager.state().value, 7);
}

#[tokio::test]
async fn reset_drops_working_diffs() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut manager = checked_out(&repo).await;

    manager.add([add(5), add(0), set(5, 12)]);
    assert_eq!(manager.working_diffs().len(), 2);
    assert_eq!(manager.state().value, 12);

    manager.reset();
    assert!(manager.working_diffs().is_empty());
    assert_eq!(manager.state().value, 0);
}

#[tokio::test]
async fn checkout_at_older_revision() {
    let repo = OTRepositoryStub::new();
    let root = repo.init_root();
    let mut manager = checked_out(&repo).await;

    manager.add([add(5)]);
    manager.commit_and_push().await.expect("push");
    assert_eq!(manager.state().value, 5);

    manager.checkout_at(root).await.expect("checkout root");
    assert_eq!(manager.state().value, 0);
    assert_eq!(manager.revision(), Some(&root));

    manager.pull().await.expect("pull");
    assert_eq!(manager.state().value, 5);
}

#[tokio::test]
async fn commit_without_checkout_fails() {
    let repo = OTRepositoryStub::new();
    repo.init_root();
    let mut manager: Manager<'_> = OTStateManager::new(
        OTAlgorithms::new(&repo, TestOpSystem),
        TestState::default(),
    );
    manager.add([add(1)]);
    assert!(matches!(
        manager.commit().await,
        Err(StateError::NotCheckedOut)
    ));
}
