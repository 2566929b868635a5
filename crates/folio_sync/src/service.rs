//! Async filter service
//!
//! One tokio task owns the [`FilterManager`]. Callers talk to it through a
//! cloneable [`FilterClient`]; every request carries a oneshot reply channel.
//! Network round trips run as child tasks in a `JoinSet` and report back to
//! the owning task, so state is only ever touched from one place.

use crate::invite::{check_join_choice, parse_invite_link, InviteLink, InviteLinkCreated, InviteLinkPreview};
use crate::manager::{Effect, FilterManager, SyncRequest};
use crate::model::{DialogFilter, FilterInfo, FilterSpec, FiltersUpdate, RecommendedFilter, ServerFilterList};
use crate::persist::{StateStore, StateWriter};
use crate::transport::{retry_transient, Backoff, DialogResolver, FilterTransport, ResolvedDialogs, TransportError};
use folio_common::{DialogId, FilterId, FolioError, InputDialogId, Result};
use folio_config::FolioConfig;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;

const COMMAND_QUEUE: usize = 64;
const UPDATE_QUEUE: usize = 64;

type Reply<T> = oneshot::Sender<Result<T>>;

enum Command {
    Create {
        spec: FilterSpec,
        at_beginning: bool,
        reply: Reply<FilterInfo>,
    },
    Edit {
        id: FilterId,
        spec: FilterSpec,
        reply: Reply<FilterInfo>,
    },
    Delete {
        id: FilterId,
        reply: Reply<()>,
    },
    Reorder {
        ids: Vec<FilterId>,
        main_position: usize,
        reply: Reply<()>,
    },
    SetPinned {
        id: FilterId,
        pinned: Vec<InputDialogId>,
        reply: Reply<()>,
    },
    SetIsPinned {
        id: FilterId,
        dialog: InputDialogId,
        is_pinned: bool,
        reply: Reply<()>,
    },
    AddDialog {
        id: FilterId,
        dialog: InputDialogId,
        reply: Reply<()>,
    },
    LoadDialogs {
        id: FilterId,
        dialogs: Option<Vec<InputDialogId>>,
        force: bool,
        reply: Reply<()>,
    },
    Get {
        id: FilterId,
        reply: oneshot::Sender<Option<DialogFilter>>,
    },
    CurrentState {
        reply: oneshot::Sender<FiltersUpdate>,
    },
    NeedSynchronize {
        reply: oneshot::Sender<bool>,
    },
    Reload {
        reply: Reply<()>,
    },
    ServerChanged,
    AuthorizationSuccess,
    RemoteFilter(DialogFilter),
    CreateInviteLink {
        id: FilterId,
        name: String,
        dialog_ids: Vec<DialogId>,
        reply: Reply<InviteLink>,
    },
    GetInviteLinks {
        id: FilterId,
        reply: Reply<Vec<InviteLink>>,
    },
    EditInviteLink {
        id: FilterId,
        slug: String,
        name: String,
        dialog_ids: Vec<DialogId>,
        reply: Reply<InviteLink>,
    },
    DeleteInviteLink {
        id: FilterId,
        slug: String,
        reply: Reply<()>,
    },
    CheckInviteLink {
        link: String,
        reply: Reply<InviteLinkPreview>,
    },
    JoinInviteLink {
        link: String,
        dialog_ids: Vec<DialogId>,
        reply: Reply<FilterId>,
    },
    Recommended {
        reply: Reply<Vec<RecommendedFilter>>,
    },
    FiltersToAddDialog {
        dialog: DialogId,
        reply: oneshot::Sender<Vec<FilterId>>,
    },
}

/// What travels over the command channel; shutdown stops the loop before any
/// command handling
enum Message {
    Command(Command),
    Shutdown(oneshot::Sender<()>),
}

/// Result of a child task, applied on the owning task
enum Completion {
    Fetched {
        epoch: u64,
        result: Result<ServerFilterList>,
    },
    Synced {
        seq: u64,
        result: Result<()>,
    },
    DialogsLoaded {
        id: FilterId,
        result: Result<ResolvedDialogs>,
        force: bool,
        reply: Option<Reply<()>>,
    },
    LinkCreated {
        result: Result<InviteLinkCreated>,
        reply: Reply<InviteLink>,
    },
    LinksListed {
        id: FilterId,
        result: Result<Vec<InviteLink>>,
        reply: Reply<Vec<InviteLink>>,
    },
    LinkEdited {
        id: FilterId,
        result: Result<InviteLink>,
        reply: Reply<InviteLink>,
    },
    LinkDeleted {
        id: FilterId,
        result: Result<()>,
        reply: Reply<()>,
    },
    LinkChecked {
        result: Result<InviteLinkPreview>,
        reply: Reply<InviteLinkPreview>,
    },
    Joined {
        chosen: Vec<DialogId>,
        result: Result<DialogFilter>,
        reply: Reply<FilterId>,
    },
    Recommended {
        result: Result<Vec<RecommendedFilter>>,
        reply: Reply<Vec<RecommendedFilter>>,
    },
}

fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

async fn sleep_until(deadline: Option<std::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(tokio::time::Instant::from_std(deadline)).await,
        None => std::future::pending().await,
    }
}

async fn send_request(transport: &dyn FilterTransport, request: &SyncRequest) -> std::result::Result<(), TransportError> {
    match request {
        SyncRequest::Save(filter) => transport.save_filter(filter).await,
        SyncRequest::Delete(id) => transport.delete_filter(*id).await,
        SyncRequest::Reorder { ids, main_position } => transport.reorder_filters(ids, *main_position).await,
    }
}

fn describe(request: &SyncRequest) -> String {
    match request {
        SyncRequest::Save(filter) => format!("Saving filter {}", filter.id),
        SyncRequest::Delete(id) => format!("Deleting filter {}", id),
        SyncRequest::Reorder { .. } => "Reordering filters".to_string(),
    }
}

pub struct FilterService {
    manager: FilterManager,
    transport: Arc<dyn FilterTransport>,
    resolver: Arc<dyn DialogResolver>,
    writer: StateWriter,
    updates: broadcast::Sender<FiltersUpdate>,
    tasks: JoinSet<Completion>,
    backoff: Backoff,
}

impl FilterService {
    /// Start the service on the current tokio runtime
    ///
    /// Persisted state is loaded from `store`; unreadable state is logged and
    /// replaced by an empty one.
    pub fn spawn(
        config: FolioConfig,
        transport: Arc<dyn FilterTransport>,
        resolver: Arc<dyn DialogResolver>,
        store: Box<dyn StateStore>,
    ) -> FilterClient {
        let mut writer = StateWriter::new(store);
        let persisted = match writer.load() {
            Ok(state) => state,
            Err(e) => {
                tracing::warn!("Ignoring unreadable filter state: {}", e);
                None
            }
        };

        let (commands, receiver) = mpsc::channel(COMMAND_QUEUE);
        let (updates, _) = broadcast::channel(UPDATE_QUEUE);
        let service = Self {
            manager: FilterManager::new(&config, persisted, now()),
            transport,
            resolver,
            writer,
            updates: updates.clone(),
            tasks: JoinSet::new(),
            backoff: Backoff::from_config(&config.sync),
        };
        tokio::spawn(service.run(receiver));

        FilterClient { commands, updates }
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Message>) {
        tracing::info!("Filter service started");
        self.drain();
        loop {
            let deadline = self.manager.next_deadline();
            tokio::select! {
                message = commands.recv() => match message {
                    Some(Message::Shutdown(reply)) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(Message::Command(command)) => self.handle_command(command),
                    // every client is gone
                    None => {
                        self.shutdown();
                        break;
                    }
                },
                Some(joined) = self.tasks.join_next(), if !self.tasks.is_empty() => match joined {
                    Ok(completion) => self.handle_completion(completion),
                    Err(e) => tracing::error!("Filter task failed: {}", e),
                },
                _ = sleep_until(deadline) => self.manager.on_timer(now()),
            }
            self.drain();
        }
        tracing::info!("Filter service stopped");
    }

    fn shutdown(&mut self) {
        tracing::info!("Filter service shutting down");
        self.tasks.abort_all();
        self.manager.shutdown();
        self.drain();
    }

    /// Carry out the effects the manager queued
    fn drain(&mut self) {
        for effect in self.manager.take_effects() {
            match effect {
                Effect::Fetch { epoch } => {
                    let transport = self.transport.clone();
                    self.tasks.spawn(async move {
                        let result = transport.list_filters().await.map_err(FolioError::from);
                        Completion::Fetched { epoch, result }
                    });
                }
                Effect::Sync { seq, request } => self.spawn_sync(seq, request),
                Effect::Persist(state) => {
                    if let Err(e) = self.writer.write(&state) {
                        tracing::error!("Failed to persist filter state: {}", e);
                    }
                }
                Effect::Notify(update) => {
                    tracing::debug!("Filters changed: {} filters", update.filters.len());
                    let _ = self.updates.send(update);
                }
                Effect::LoadDialogs { filter_id, dialogs } => self.spawn_load(filter_id, dialogs, true, None),
            }
        }
    }

    fn spawn_sync(&mut self, seq: u64, request: SyncRequest) {
        let transport = self.transport.clone();
        let backoff = self.backoff;
        self.tasks.spawn(async move {
            let what = describe(&request);
            let transport = transport.as_ref();
            let request = &request;
            let result = retry_transient(backoff, &what, move || send_request(transport, request))
                .await
                .map_err(FolioError::from);
            Completion::Synced { seq, result }
        });
    }

    fn spawn_load(&mut self, id: FilterId, dialogs: Vec<InputDialogId>, force: bool, reply: Option<Reply<()>>) {
        let resolver = self.resolver.clone();
        self.tasks.spawn(async move {
            let result = resolver.resolve(&dialogs).await.map_err(FolioError::from);
            Completion::DialogsLoaded {
                id,
                result,
                force,
                reply,
            }
        });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Create {
                spec,
                at_beginning,
                reply,
            } => {
                let _ = reply.send(self.manager.create(spec, at_beginning));
            }
            Command::Edit { id, spec, reply } => {
                let _ = reply.send(self.manager.edit(id, spec));
            }
            Command::Delete { id, reply } => {
                let _ = reply.send(self.manager.delete(id));
            }
            Command::Reorder {
                ids,
                main_position,
                reply,
            } => {
                let _ = reply.send(self.manager.reorder(ids, main_position));
            }
            Command::SetPinned { id, pinned, reply } => {
                let _ = reply.send(self.manager.set_pinned(id, pinned));
            }
            Command::SetIsPinned {
                id,
                dialog,
                is_pinned,
                reply,
            } => {
                let _ = reply.send(self.manager.set_is_pinned(id, dialog, is_pinned));
            }
            Command::AddDialog { id, dialog, reply } => {
                let _ = reply.send(self.manager.add_dialog(id, dialog));
            }
            Command::LoadDialogs {
                id,
                dialogs,
                force,
                reply,
            } => {
                let checked = match dialogs {
                    Some(dialogs) => self.manager.check_filter_dialogs(id, &dialogs).map(|_| dialogs),
                    None => self.manager.dialogs_to_load(id),
                };
                match checked {
                    Ok(dialogs) if dialogs.is_empty() => {
                        let _ = reply.send(Ok(()));
                    }
                    Ok(dialogs) => self.spawn_load(id, dialogs, force, Some(reply)),
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            Command::Get { id, reply } => {
                let _ = reply.send(self.manager.get_filter(id).cloned());
            }
            Command::CurrentState { reply } => {
                let _ = reply.send(self.manager.current_state());
            }
            Command::NeedSynchronize { reply } => {
                let _ = reply.send(self.manager.need_synchronize());
            }
            Command::Reload { reply } => self.manager.request_reload(Some(reply)),
            Command::ServerChanged => self.manager.on_update_filters(),
            Command::AuthorizationSuccess => self.manager.on_authorization_success(),
            Command::RemoteFilter(filter) => self.manager.on_remote_filter(filter),
            Command::CreateInviteLink {
                id,
                name,
                dialog_ids,
                reply,
            } => {
                if let Err(e) = self.manager.check_invite_link_request(id, &name, &dialog_ids) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport
                        .create_invite_link(id, &name, &dialog_ids)
                        .await
                        .map_err(FolioError::from);
                    Completion::LinkCreated { result, reply }
                });
            }
            Command::GetInviteLinks { id, reply } => {
                if let Err(e) = self.manager.check_filter_exists(id) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport.get_invite_links(id).await.map_err(FolioError::from);
                    Completion::LinksListed { id, result, reply }
                });
            }
            Command::EditInviteLink {
                id,
                slug,
                name,
                dialog_ids,
                reply,
            } => {
                if let Err(e) = self.manager.check_invite_link_request(id, &name, &dialog_ids) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport
                        .edit_invite_link(id, &slug, &name, &dialog_ids)
                        .await
                        .map_err(FolioError::from);
                    Completion::LinkEdited { id, result, reply }
                });
            }
            Command::DeleteInviteLink { id, slug, reply } => {
                if let Err(e) = self.manager.check_filter_exists(id) {
                    let _ = reply.send(Err(e));
                    return;
                }
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport
                        .delete_invite_link(id, &slug)
                        .await
                        .map_err(FolioError::from);
                    Completion::LinkDeleted { id, result, reply }
                });
            }
            Command::CheckInviteLink { link, reply } => {
                let slug = match parse_invite_link(&link) {
                    Ok(slug) => slug,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport.check_invite_link(&slug).await.map_err(FolioError::from);
                    Completion::LinkChecked { result, reply }
                });
            }
            Command::JoinInviteLink {
                link,
                dialog_ids,
                reply,
            } => {
                let slug = match parse_invite_link(&link) {
                    Ok(slug) => slug,
                    Err(e) => {
                        let _ = reply.send(Err(e));
                        return;
                    }
                };
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = join(transport.as_ref(), &slug, &dialog_ids).await;
                    Completion::Joined {
                        chosen: dialog_ids,
                        result,
                        reply,
                    }
                });
            }
            Command::Recommended { reply } => {
                let transport = self.transport.clone();
                self.tasks.spawn(async move {
                    let result = transport
                        .get_recommended_filters()
                        .await
                        .map_err(FolioError::from);
                    Completion::Recommended { result, reply }
                });
            }
            Command::FiltersToAddDialog { dialog, reply } => {
                let _ = reply.send(self.manager.filters_to_add_dialog(dialog));
            }
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Fetched { epoch, result } => self.manager.on_fetch_result(epoch, result, now()),
            Completion::Synced { seq, result } => self.manager.on_sync_result(seq, result),
            Completion::DialogsLoaded {
                id,
                result,
                force,
                reply,
            } => {
                let outcome = match result {
                    Ok(resolved) => {
                        self.manager.on_dialogs_loaded(id, &resolved.unavailable);
                        Ok(())
                    }
                    Err(e) if force => {
                        tracing::warn!(filter_id = %id, "Failed to load filter dialogs, continuing: {}", e);
                        Ok(())
                    }
                    Err(e) => {
                        tracing::warn!(filter_id = %id, "Failed to load filter dialogs: {}", e);
                        Err(e)
                    }
                };
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
            Completion::LinkCreated { result, reply } => {
                let outcome = result.map(|created| {
                    self.manager.on_invite_link_created(&created);
                    created.link
                });
                let _ = reply.send(outcome);
            }
            Completion::LinksListed { id, result, reply } => {
                if let Ok(links) = &result {
                    tracing::debug!(filter_id = %id, "Listed {} invite links", links.len());
                }
                let _ = reply.send(result);
            }
            Completion::LinkEdited { id, result, reply } => {
                if result.is_ok() {
                    self.manager.on_invite_links_changed(id);
                }
                let _ = reply.send(result);
            }
            Completion::LinkDeleted { id, result, reply } => {
                if result.is_ok() {
                    self.manager.on_invite_links_changed(id);
                }
                let _ = reply.send(result);
            }
            Completion::LinkChecked { result, reply } => {
                let _ = reply.send(result.map(|preview| self.manager.annotate_preview(preview)));
            }
            Completion::Joined { chosen, result, reply } => {
                let outcome = result.and_then(|filter| self.manager.on_joined_filter(filter, &chosen));
                let _ = reply.send(outcome);
            }
            Completion::Recommended { result, reply } => {
                let _ = reply.send(result.map(|recommended| self.manager.filter_recommended(recommended)));
            }
        }
    }
}

/// Preview, validate the choice, then join
async fn join(transport: &dyn FilterTransport, slug: &str, chosen: &[DialogId]) -> Result<DialogFilter> {
    let preview = transport.check_invite_link(slug).await?;
    check_join_choice(&preview, chosen)?;
    Ok(transport.join_invite_link(slug, chosen).await?)
}

/// Handle to a running [`FilterService`]
///
/// Every method fails with [`FolioError::Cancelled`] once the service has
/// shut down.
#[derive(Clone)]
pub struct FilterClient {
    commands: mpsc::Sender<Message>,
    updates: broadcast::Sender<FiltersUpdate>,
}

impl FilterClient {
    async fn call<T>(&self, command: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.notify(command(reply)).await?;
        response.await.map_err(|_| FolioError::Cancelled)
    }

    async fn notify(&self, command: Command) -> Result<()> {
        self.commands
            .send(Message::Command(command))
            .await
            .map_err(|_| FolioError::Cancelled)
    }

    /// Receive every "filters changed" notification from now on
    pub fn subscribe(&self) -> broadcast::Receiver<FiltersUpdate> {
        self.updates.subscribe()
    }

    #[tracing::instrument(skip(self, spec), fields(title = %spec.title))]
    pub async fn create_filter(&self, spec: FilterSpec, at_beginning: bool) -> Result<FilterInfo> {
        self.call(|reply| Command::Create {
            spec,
            at_beginning,
            reply,
        })
        .await?
    }

    #[tracing::instrument(skip(self, spec))]
    pub async fn edit_filter(&self, id: FilterId, spec: FilterSpec) -> Result<FilterInfo> {
        self.call(|reply| Command::Edit { id, spec, reply }).await?
    }

    #[tracing::instrument(skip(self))]
    pub async fn delete_filter(&self, id: FilterId) -> Result<()> {
        self.call(|reply| Command::Delete { id, reply }).await?
    }

    #[tracing::instrument(skip(self))]
    pub async fn reorder_filters(&self, ids: Vec<FilterId>, main_position: usize) -> Result<()> {
        self.call(|reply| Command::Reorder {
            ids,
            main_position,
            reply,
        })
        .await?
    }

    pub async fn set_pinned_dialogs(&self, id: FilterId, pinned: Vec<InputDialogId>) -> Result<()> {
        self.call(|reply| Command::SetPinned { id, pinned, reply }).await?
    }

    pub async fn set_dialog_is_pinned(&self, id: FilterId, dialog: InputDialogId, is_pinned: bool) -> Result<()> {
        self.call(|reply| Command::SetIsPinned {
            id,
            dialog,
            is_pinned,
            reply,
        })
        .await?
    }

    pub async fn add_dialog(&self, id: FilterId, dialog: InputDialogId) -> Result<()> {
        self.call(|reply| Command::AddDialog { id, dialog, reply }).await?
    }

    /// Hydrate every dialog of a filter
    ///
    /// With `force`, a resolver failure is logged and the call still succeeds.
    pub async fn load_filter(&self, id: FilterId, force: bool) -> Result<()> {
        self.call(|reply| Command::LoadDialogs {
            id,
            dialogs: None,
            force,
            reply,
        })
        .await?
    }

    /// Hydrate a subset of a filter's dialogs
    pub async fn load_filter_dialogs(&self, id: FilterId, dialogs: Vec<InputDialogId>) -> Result<()> {
        self.call(|reply| Command::LoadDialogs {
            id,
            dialogs: Some(dialogs),
            force: false,
            reply,
        })
        .await?
    }

    pub async fn get_filter(&self, id: FilterId) -> Result<Option<DialogFilter>> {
        self.call(|reply| Command::Get { id, reply }).await
    }

    pub async fn current_state(&self) -> Result<FiltersUpdate> {
        self.call(|reply| Command::CurrentState { reply }).await
    }

    pub async fn need_synchronize(&self) -> Result<bool> {
        self.call(|reply| Command::NeedSynchronize { reply }).await
    }

    /// Wait for the next completed fetch of the filter list
    #[tracing::instrument(skip(self))]
    pub async fn reload(&self) -> Result<()> {
        self.call(|reply| Command::Reload { reply }).await?
    }

    /// The server signalled that its filter list changed
    pub async fn on_update_filters(&self) -> Result<()> {
        self.notify(Command::ServerChanged).await
    }

    pub async fn on_authorization_success(&self) -> Result<()> {
        self.notify(Command::AuthorizationSuccess).await
    }

    /// A single definition pushed by the server
    pub async fn on_remote_filter(&self, filter: DialogFilter) -> Result<()> {
        self.notify(Command::RemoteFilter(filter)).await
    }

    #[tracing::instrument(skip(self, name, dialog_ids))]
    pub async fn create_invite_link(&self, id: FilterId, name: String, dialog_ids: Vec<DialogId>) -> Result<InviteLink> {
        self.call(|reply| Command::CreateInviteLink {
            id,
            name,
            dialog_ids,
            reply,
        })
        .await?
    }

    pub async fn get_invite_links(&self, id: FilterId) -> Result<Vec<InviteLink>> {
        self.call(|reply| Command::GetInviteLinks { id, reply }).await?
    }

    pub async fn edit_invite_link(
        &self,
        id: FilterId,
        slug: String,
        name: String,
        dialog_ids: Vec<DialogId>,
    ) -> Result<InviteLink> {
        self.call(|reply| Command::EditInviteLink {
            id,
            slug,
            name,
            dialog_ids,
            reply,
        })
        .await?
    }

    pub async fn delete_invite_link(&self, id: FilterId, slug: String) -> Result<()> {
        self.call(|reply| Command::DeleteInviteLink { id, slug, reply }).await?
    }

    pub async fn check_invite_link(&self, link: String) -> Result<InviteLinkPreview> {
        self.call(|reply| Command::CheckInviteLink { link, reply }).await?
    }

    /// Import the chosen dialogs of a link; returns the receiving filter
    #[tracing::instrument(skip(self, dialog_ids))]
    pub async fn join_invite_link(&self, link: String, dialog_ids: Vec<DialogId>) -> Result<FilterId> {
        self.call(|reply| Command::JoinInviteLink {
            link,
            dialog_ids,
            reply,
        })
        .await?
    }

    pub async fn recommended_filters(&self) -> Result<Vec<RecommendedFilter>> {
        self.call(|reply| Command::Recommended { reply }).await?
    }

    /// Filters that could take the dialog without passing their dialog ceiling
    pub async fn filters_to_add_dialog(&self, dialog: DialogId) -> Result<Vec<FilterId>> {
        self.call(|reply| Command::FiltersToAddDialog { dialog, reply }).await
    }

    /// Cancel outstanding work, persist, and stop the service
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Message::Shutdown(reply))
            .await
            .map_err(|_| FolioError::Cancelled)?;
        response.await.map_err(|_| FolioError::Cancelled)
    }
}
