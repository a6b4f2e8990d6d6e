use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use otsync::global::node::Result;
use otsync::global::types::SignedHead;
use otsync::global::types::SignedPullRequest;
use otsync::global::types::SignedSnapshot;
use otsync::global::CommitEntry;
use otsync::global::CommitId;
use otsync::global::EntryStream;
use otsync::global::GlobalOTNode;
use otsync::global::HeadsInfo;
use otsync::global::KeyPair;
use otsync::global::NodeError;
use otsync::global::OTDriver;
use otsync::global::OTRepositoryAdapter;
use otsync::global::PubKey;
use otsync::global::RawCommit;
use otsync::global::RepoId;
use otsync::global::SimKey;
use otsync::global::ValidatingGlobalOTNode;
use otsync::ot::OTAlgorithms;
use otsync::ot::OTStateManager;

mod util;
use util::*;

/// A master that is announced but never answers.
struct Unreachable;

fn down<T>() -> Result<T> {
    Err(NodeError::Unavailable("connection refused".into()))
}

#[async_trait]
impl GlobalOTNode for Unreachable {
    async fn list(&self, _pub_key: PubKey) -> Result<BTreeSet<String>> {
        down()
    }

    async fn save(&self, _repo: &RepoId, _commits: BTreeMap<CommitId, RawCommit>) -> Result<()> {
        down()
    }

    async fn save_heads(&self, _repo: &RepoId, _heads: BTreeSet<SignedHead>) -> Result<()> {
        down()
    }

    async fn load_commit(&self, _repo: &RepoId, _id: CommitId) -> Result<RawCommit> {
        down()
    }

    async fn has_commit(&self, _repo: &RepoId, _id: CommitId) -> Result<bool> {
        down()
    }

    async fn get_heads_info(&self, _repo: &RepoId) -> Result<HeadsInfo> {
        down()
    }

    async fn get_heads(&self, _repo: &RepoId) -> Result<BTreeSet<SignedHead>> {
        down()
    }

    async fn poll_heads(
        &self,
        _repo: &RepoId,
        _known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<SignedHead>> {
        down()
    }

    async fn download(
        &self,
        _repo: &RepoId,
        _required: BTreeSet<CommitId>,
        _existing: BTreeSet<CommitId>,
    ) -> Result<EntryStream> {
        down()
    }

    async fn upload(
        &self,
        _repo: &RepoId,
        _entries: EntryStream,
        _heads: BTreeSet<SignedHead>,
    ) -> Result<()> {
        down()
    }

    async fn save_snapshot(&self, _repo: &RepoId, _snapshot: SignedSnapshot) -> Result<()> {
        down()
    }

    async fn load_snapshot(&self, _repo: &RepoId, _id: CommitId) -> Result<Option<SignedSnapshot>> {
        down()
    }

    async fn list_snapshots(
        &self,
        _repo: &RepoId,
        _known: BTreeSet<CommitId>,
    ) -> Result<BTreeSet<CommitId>> {
        down()
    }

    async fn send_pull_request(&self, _pull_request: SignedPullRequest) -> Result<()> {
        down()
    }

    async fn get_pull_requests(&self, _repo: &RepoId) -> Result<BTreeSet<SignedPullRequest>> {
        down()
    }

    async fn fetch(&self, _repo: &RepoId) -> Result<()> {
        down()
    }

    async fn push(&self, _repo: &RepoId) -> Result<()> {
        down()
    }
}

fn entries(chain: &[(CommitId, RawCommit)]) -> EntryStream {
    let entries: Vec<Result<CommitEntry>> = chain
        .iter()
        .map(|(id, commit)| Ok(CommitEntry::new(*id, commit.clone())))
        .collect();
    stream::iter(entries).boxed()
}

async fn collect(entries: EntryStream) -> Vec<CommitEntry> {
    entries
        .map(|entry| entry.expect("entry"))
        .collect()
        .await
}

fn head_ids(heads: &BTreeSet<SignedHead>) -> BTreeSet<CommitId> {
    heads.iter().map(|head| head.value().commit_id).collect()
}

/// Stores `chain` on `node` with its last commit as head.
async fn store_chain(net: &Network, node: &dyn GlobalOTNode, chain: &[(CommitId, RawCommit)]) {
    node.save(&net.repo, chain.iter().cloned().collect())
        .await
        .expect("save");
    let (last, _) = chain.last().expect("non-empty chain");
    node.save_heads(&net.repo, [net.head(*last)].into())
        .await
        .expect("save heads");
}

#[tokio::test]
async fn master_stores_commits_by_content() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);
    store_chain(&net, &*master, &chain).await;

    let (id, commit) = &chain[0];
    let loaded = master.load_commit(&net.repo, *id).await.expect("load");
    assert_eq!(&loaded, commit);
    assert_eq!(loaded.commit_id().expect("id"), *id);

    let (missing, _) = raw_commit(&[CommitId::root()], 99);
    assert!(matches!(
        master.load_commit(&net.repo, missing).await,
        Err(NodeError::CommitNotFound(id)) if id == missing
    ));
    assert!(!master.has_commit(&net.repo, missing).await.expect("has"));
}

#[tokio::test]
async fn ancestors_never_become_heads() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);
    store_chain(&net, &*master, &chain).await;

    master
        .save_heads(&net.repo, [net.head(chain[0].0)].into())
        .await
        .expect("save old head");
    let heads = master.get_heads(&net.repo).await.expect("heads");
    assert_eq!(head_ids(&heads), [chain[2].0].into());

    let info = master.get_heads_info(&net.repo).await.expect("heads info");
    assert_eq!(info.existing, [chain[2].0].into());
    assert!(info.required.is_empty());
}

#[tokio::test]
async fn download_sends_missing_commits_in_level_order() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);
    store_chain(&net, &*master, &chain).await;

    let all = collect(
        master
            .download(&net.repo, BTreeSet::new(), BTreeSet::new())
            .await
            .expect("download"),
    )
    .await;
    let ids: Vec<CommitId> = all.iter().map(|entry| entry.commit_id).collect();
    assert_eq!(ids, chain.iter().map(|(id, _)| *id).collect::<Vec<_>>());
    assert!(all[..2].iter().all(|entry| entry.head.is_none()));
    assert_eq!(
        all[2].head.as_ref().map(|head| head.value().commit_id),
        Some(chain[2].0)
    );

    let rest = collect(
        master
            .download(&net.repo, BTreeSet::new(), [chain[0].0].into())
            .await
            .expect("download"),
    )
    .await;
    let ids: Vec<CommitId> = rest.iter().map(|entry| entry.commit_id).collect();
    assert_eq!(ids, vec![chain[1].0, chain[2].0]);
}

#[tokio::test]
async fn download_sends_ancestors_shared_with_existing_heads() {
    // a <- b <- e and a <- c; the consumer only knows e.
    let (a, a_commit) = raw_commit(&[CommitId::root()], 0);
    let (b, b_commit) = raw_commit(&[a], 1);
    let (e, e_commit) = raw_commit(&[b], 2);
    for tag in 10..30 {
        let net = Network::new();
        let master = net.master("master");
        net.announce(1, &["master"]).await;
        let (c, c_commit) = raw_commit(&[a], tag);
        let commits = [
            (a, a_commit.clone()),
            (b, b_commit.clone()),
            (e, e_commit.clone()),
            (c, c_commit),
        ];
        master
            .save(&net.repo, commits.into_iter().collect())
            .await
            .expect("save");
        master
            .save_heads(&net.repo, [net.head(e), net.head(c)].into())
            .await
            .expect("save heads");

        let validating = ValidatingGlobalOTNode::new(master.clone());
        let sent = validating
            .download(&net.repo, BTreeSet::new(), [e].into())
            .await
            .expect("download");
        let ids: Vec<CommitId> = collect(sent).await.iter().map(|entry| entry.commit_id).collect();
        assert_eq!(ids, vec![a, c], "tag {tag}");
    }
}

#[tokio::test]
async fn heads_info_requires_missing_ancestors() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);
    master
        .save(&net.repo, [chain[0].clone(), chain[2].clone()].into())
        .await
        .expect("save");
    master
        .save_heads(&net.repo, [net.head(chain[2].0)].into())
        .await
        .expect("save heads");
    let (dangling, _) = raw_commit(&[CommitId::root()], 42);
    master
        .storage()
        .update_heads(&net.repo, [net.head(dangling)].into(), BTreeSet::new())
        .await
        .expect("store dangling head");

    let info = master.get_heads_info(&net.repo).await.expect("heads info");
    assert_eq!(info.existing, [chain[2].0].into());
    // The complete first commit stops the walk; only the gap is required.
    assert_eq!(info.required, [chain[1].0, dangling].into());
    assert!(info.existing.is_disjoint(&info.required));
}

#[tokio::test]
async fn download_rejects_overlapping_sets() {
    let net = Network::new();
    let master = net.master("master");
    let chain = raw_chain(1);
    let id = chain[0].0;
    assert!(matches!(
        master.download(&net.repo, [id].into(), [id].into()).await,
        Err(NodeError::InvalidArgument(_))
    ));
}

#[tokio::test]
async fn relay_forwards_writes_to_master() {
    init_tracing();
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(2);
    store_chain(&net, &*relay, &chain).await;

    for (id, _) in &chain {
        assert!(master.has_commit(&net.repo, *id).await.expect("has"));
    }
    let heads = master.get_heads(&net.repo).await.expect("heads");
    assert_eq!(head_ids(&heads), [chain[1].0].into());
    assert!(!relay.is_master_for(&net.owner.pub_key()));
    assert!(master.is_master_for(&net.owner.pub_key()));

    let names = relay.list(net.owner.pub_key()).await.expect("list");
    assert_eq!(names, ["repo".to_string()].into());
}

#[tokio::test]
async fn relay_reads_through_and_caches() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(2);
    store_chain(&net, &*master, &chain).await;

    let heads = relay.get_heads(&net.repo).await.expect("heads");
    assert_eq!(head_ids(&heads), [chain[1].0].into());
    let (id, commit) = &chain[0];
    assert_eq!(&relay.load_commit(&net.repo, *id).await.expect("load"), commit);
    assert!(relay.storage().has_commit(*id).await.expect("cached"));
}

#[tokio::test]
async fn relay_upload_reaches_master() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);
    let (last, _) = chain[2];

    relay
        .upload(&net.repo, entries(&chain), [net.head(last)].into())
        .await
        .expect("upload");

    let heads = master.get_heads(&net.repo).await.expect("heads");
    assert_eq!(head_ids(&heads), [last].into());
    for (id, _) in &chain {
        assert!(master.has_commit(&net.repo, *id).await.expect("has"));
    }
}

#[tokio::test]
async fn upload_with_unknown_parent_is_refused() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(3);

    let result = master
        .upload(&net.repo, entries(&chain[1..]), BTreeSet::new())
        .await;
    assert!(matches!(result, Err(NodeError::UnexpectedCommit(id)) if id == chain[1].0));
    assert!(!master.has_commit(&net.repo, chain[2].0).await.expect("has"));
}

#[tokio::test]
async fn fetch_succeeds_while_one_master_is_down() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.register("broken", Arc::new(Unreachable));
    net.announce(1, &["broken", "master"]).await;
    let chain = raw_chain(3);
    store_chain(&net, &*master, &chain).await;

    relay.fetch(&net.repo).await.expect("fetch");

    for (id, _) in &chain {
        assert!(relay.storage().has_commit(*id).await.expect("has"));
    }
    let heads: BTreeSet<CommitId> = relay
        .storage()
        .get_heads(&net.repo)
        .await
        .expect("heads")
        .into_keys()
        .collect();
    assert_eq!(heads, [chain[2].0].into());
    assert_eq!(relay.master_ids(&net.owner.pub_key()).len(), 2);
}

#[tokio::test]
async fn fetch_fails_when_every_master_fails() {
    let net = Network::new();
    let relay = net.relay("relay");

    assert!(matches!(
        relay.fetch(&net.repo).await,
        Err(NodeError::NoMasters(_))
    ));

    net.register("broken", Arc::new(Unreachable));
    net.announce(1, &["broken"]).await;
    assert!(matches!(
        relay.fetch(&net.repo).await,
        Err(NodeError::Unavailable(_))
    ));
}

#[tokio::test]
async fn push_sends_local_commits_to_master() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(2);
    let (last, _) = chain[1];

    relay
        .upload_local(&net.repo, entries(&chain), [net.head(last)].into())
        .await
        .expect("upload locally");
    assert!(!master.has_commit(&net.repo, last).await.expect("has"));

    relay.push(&net.repo).await.expect("push");
    let heads = master.get_heads(&net.repo).await.expect("heads");
    assert_eq!(head_ids(&heads), [last].into());
}

#[tokio::test]
async fn poll_heads_waits_for_new_heads() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let chain = raw_chain(2);
    store_chain(&net, &*master, &chain[..1]).await;

    let known: BTreeSet<CommitId> = [chain[0].0].into();
    let poll = tokio::spawn({
        let master = master.clone();
        let repo = net.repo.clone();
        async move { master.poll_heads(&repo, known).await }
    });
    tokio::task::yield_now().await;
    assert!(!poll.is_finished());

    store_chain(&net, &*master, &chain).await;
    let heads = tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("poll resolved")
        .expect("task")
        .expect("poll");
    assert_eq!(head_ids(&heads), [chain[1].0].into());
}

type Client = OTStateManager<OTRepositoryAdapter<TestOp>, TestOpSystem, TestState>;

fn client(net: &Network, node: Arc<dyn GlobalOTNode>, keys: &KeyPair, sim_key: &SimKey) -> Client {
    let node: Arc<dyn GlobalOTNode> = Arc::new(ValidatingGlobalOTNode::new(node));
    let driver = Arc::new(OTDriver::new(node, keys.clone(), sim_key.clone()));
    let repository = OTRepositoryAdapter::new(driver, net.repo.clone());
    OTStateManager::new(OTAlgorithms::new(repository, TestOpSystem), TestState::default())
}

#[tokio::test]
async fn clients_on_relay_and_master_converge() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let sim_key = SimKey::generate();
    let mut near = client(&net, master.clone(), &net.owner, &sim_key);
    let mut far = client(&net, relay.clone(), &net.owner, &sim_key);

    near.checkout().await.expect("checkout near");
    far.checkout().await.expect("checkout far");
    assert_eq!(near.revision(), Some(&CommitId::root()));

    far.add([add(10)]);
    near.add([add(10)]);
    far.sync().await.expect("sync far");
    near.sync().await.expect("sync near");
    far.sync().await.expect("sync far again");

    assert_eq!(near.state().value, 20);
    assert_eq!(far.state().value, 20);
    assert_eq!(near.revision(), far.revision());

    let head = *far.revision().expect("revision");
    let stored = master.load_commit(&net.repo, head).await.expect("load");
    assert_ne!(stored.encrypted_diffs.ciphertext, Vec::<u8>::new());
    assert_eq!(stored.commit_id().expect("id"), head);
}

#[tokio::test]
async fn snapshots_and_pull_requests_travel_through_relay() {
    let net = Network::new();
    let master = net.master("master");
    let relay = net.relay("relay");
    net.announce(1, &["master"]).await;
    let sim_key = SimKey::generate();
    let mut far = client(&net, relay.clone(), &net.owner, &sim_key);

    far.checkout().await.expect("checkout");
    far.add([add(4)]);
    let head = far
        .commit_and_push()
        .await
        .expect("push")
        .expect("committed");
    far.algorithms()
        .save_snapshot(&head)
        .await
        .expect("save snapshot");

    let owner_driver = OTDriver::new(master.clone(), net.owner.clone(), sim_key.clone());
    let snapshot = owner_driver
        .load_snapshot::<TestOp>(&net.repo, head)
        .await
        .expect("load snapshot");
    assert_eq!(snapshot, Some(vec![add(4)]));

    let forker = KeyPair::generate();
    let fork = RepoId::new(forker.pub_key(), "fork");
    let fork_driver = OTDriver::new(
        Arc::new(ValidatingGlobalOTNode::new(relay.clone())),
        forker,
        sim_key,
    );
    fork_driver
        .send_pull_request(&net.repo, &fork)
        .await
        .expect("send pull request");
    let forks = owner_driver
        .get_pull_requests(&net.repo)
        .await
        .expect("pull requests");
    assert_eq!(forks, [fork].into());
}

#[tokio::test]
async fn foreign_sim_key_cannot_read_commits() {
    let net = Network::new();
    let master = net.master("master");
    net.announce(1, &["master"]).await;
    let mut writer = client(&net, master.clone(), &net.owner, &SimKey::generate());
    writer.checkout().await.expect("checkout");
    writer.add([add(1)]);
    let head = writer
        .commit_and_push()
        .await
        .expect("push")
        .expect("committed");

    let reader = OTDriver::new(master.clone(), net.owner.clone(), SimKey::generate());
    assert!(reader
        .load_commit::<TestOp>(&net.repo, head)
        .await
        .is_err());
}
