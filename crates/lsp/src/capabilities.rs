//! Capability negotiation helpers.
//!
//! Rather than a server "kind" hierarchy, routing is data-driven: every
//! capability-gated request is checked against the negotiated
//! [`ServerCapabilities`] through [`has_capability`] before any bytes go on
//! the wire.

use lsp_types::{
	ClientCapabilities, CompletionClientCapabilities, CompletionItemCapability, CompletionItemCapabilityResolveSupport, DiagnosticClientCapabilities,
	GeneralClientCapabilities, HoverClientCapabilities, MarkupKind, OneOf, PositionEncodingKind, PublishDiagnosticsClientCapabilities,
	RenameClientCapabilities, ServerCapabilities, SignatureHelpClientCapabilities, SignatureInformationSettings, TagSupport,
	TextDocumentClientCapabilities, TextDocumentSyncCapability, TextDocumentSyncKind, WindowClientCapabilities, WorkspaceClientCapabilities,
};

/// Synchronization strategy negotiated for one buffer. Chosen once from the
/// server's capabilities when the buffer attaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncKind {
	/// The server does not want change notifications.
	None,
	/// Resend the whole document on every change.
	Full,
	/// Send minimal range edits.
	Incremental,
}

/// Build the client capabilities advertised during `initialize`.
pub fn client_capabilities() -> ClientCapabilities {
	ClientCapabilities {
		workspace: Some(WorkspaceClientCapabilities {
			configuration: Some(true),
			did_change_configuration: Some(lsp_types::DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			workspace_folders: Some(true),
			execute_command: Some(lsp_types::DynamicRegistrationClientCapabilities {
				dynamic_registration: Some(false),
			}),
			workspace_edit: Some(lsp_types::WorkspaceEditClientCapabilities {
				document_changes: Some(true),
				failure_handling: Some(lsp_types::FailureHandlingKind::Abort),
				normalizes_line_endings: Some(false),
				..Default::default()
			}),
			diagnostic: Some(lsp_types::DiagnosticWorkspaceClientCapabilities {
				refresh_support: Some(false),
			}),
			..Default::default()
		}),
		text_document: Some(TextDocumentClientCapabilities {
			synchronization: Some(lsp_types::TextDocumentSyncClientCapabilities {
				dynamic_registration: Some(false),
				will_save: Some(true),
				will_save_wait_until: Some(true),
				did_save: Some(true),
			}),
			completion: Some(CompletionClientCapabilities {
				completion_item: Some(CompletionItemCapability {
					snippet_support: Some(false),
					resolve_support: Some(CompletionItemCapabilityResolveSupport {
						properties: vec![String::from("documentation"), String::from("detail"), String::from("additionalTextEdits")],
					}),
					insert_replace_support: Some(true),
					deprecated_support: Some(true),
					tag_support: Some(TagSupport {
						value_set: vec![lsp_types::CompletionItemTag::DEPRECATED],
					}),
					..Default::default()
				}),
				..Default::default()
			}),
			hover: Some(HoverClientCapabilities {
				content_format: Some(vec![MarkupKind::Markdown]),
				..Default::default()
			}),
			signature_help: Some(SignatureHelpClientCapabilities {
				signature_information: Some(SignatureInformationSettings {
					documentation_format: Some(vec![MarkupKind::Markdown]),
					parameter_information: Some(lsp_types::ParameterInformationSettings {
						label_offset_support: Some(true),
					}),
					active_parameter_support: Some(true),
				}),
				..Default::default()
			}),
			rename: Some(RenameClientCapabilities {
				dynamic_registration: Some(false),
				prepare_support: Some(true),
				..Default::default()
			}),
			formatting: Some(lsp_types::DocumentFormattingClientCapabilities {
				dynamic_registration: Some(false),
			}),
			code_action: Some(lsp_types::CodeActionClientCapabilities {
				code_action_literal_support: Some(lsp_types::CodeActionLiteralSupport {
					code_action_kind: lsp_types::CodeActionKindLiteralSupport {
						value_set: [
							lsp_types::CodeActionKind::EMPTY,
							lsp_types::CodeActionKind::QUICKFIX,
							lsp_types::CodeActionKind::REFACTOR,
							lsp_types::CodeActionKind::SOURCE,
							lsp_types::CodeActionKind::SOURCE_ORGANIZE_IMPORTS,
							lsp_types::CodeActionKind::SOURCE_FIX_ALL,
						]
						.iter()
						.map(|kind| kind.as_str().to_string())
						.collect(),
					},
				}),
				is_preferred_support: Some(true),
				disabled_support: Some(true),
				data_support: Some(true),
				resolve_support: Some(lsp_types::CodeActionCapabilityResolveSupport {
					properties: vec!["edit".to_owned(), "command".to_owned()],
				}),
				..Default::default()
			}),
			diagnostic: Some(DiagnosticClientCapabilities {
				dynamic_registration: Some(false),
				related_document_support: Some(false),
			}),
			publish_diagnostics: Some(PublishDiagnosticsClientCapabilities {
				version_support: Some(true),
				tag_support: Some(TagSupport {
					value_set: vec![lsp_types::DiagnosticTag::UNNECESSARY, lsp_types::DiagnosticTag::DEPRECATED],
				}),
				..Default::default()
			}),
			..Default::default()
		}),
		window: Some(WindowClientCapabilities {
			work_done_progress: Some(true),
			..Default::default()
		}),
		general: Some(GeneralClientCapabilities {
			position_encodings: Some(vec![PositionEncodingKind::UTF16]),
			..Default::default()
		}),
		..Default::default()
	}
}

/// Whether the server advertised support for `method`.
///
/// Unknown methods report `false`; callers are expected to consult this
/// before issuing capability-gated requests.
pub fn has_capability(caps: &ServerCapabilities, method: &str) -> bool {
	match method {
		"textDocument/hover" => match caps.hover_provider.as_ref() {
			Some(lsp_types::HoverProviderCapability::Simple(enabled)) => *enabled,
			Some(lsp_types::HoverProviderCapability::Options(_)) => true,
			None => false,
		},
		"textDocument/completion" => caps.completion_provider.is_some(),
		"textDocument/signatureHelp" => caps.signature_help_provider.is_some(),
		"textDocument/definition" => one_of_enabled(caps.definition_provider.as_ref()),
		"textDocument/references" => one_of_enabled(caps.references_provider.as_ref()),
		"textDocument/documentSymbol" => one_of_enabled(caps.document_symbol_provider.as_ref()),
		"textDocument/formatting" => one_of_enabled(caps.document_formatting_provider.as_ref()),
		"textDocument/rangeFormatting" => one_of_enabled(caps.document_range_formatting_provider.as_ref()),
		"textDocument/codeAction" => match caps.code_action_provider.as_ref() {
			Some(lsp_types::CodeActionProviderCapability::Simple(enabled)) => *enabled,
			Some(lsp_types::CodeActionProviderCapability::Options(_)) => true,
			None => false,
		},
		"textDocument/rename" => match caps.rename_provider.as_ref() {
			Some(OneOf::Left(enabled)) => *enabled,
			Some(OneOf::Right(_)) => true,
			None => false,
		},
		"workspace/executeCommand" => caps.execute_command_provider.is_some(),
		"textDocument/diagnostic" | "workspace/diagnostic" => caps.diagnostic_provider.is_some(),
		"textDocument/didOpen" | "textDocument/didClose" => sync_options(caps).is_some_and(|o| o.open_close == Some(true)) || matches!(caps.text_document_sync, Some(TextDocumentSyncCapability::Kind(k)) if k != TextDocumentSyncKind::NONE),
		"textDocument/didChange" => negotiated_sync_kind(caps) != SyncKind::None,
		"textDocument/didSave" => sync_options(caps).is_some_and(|o| o.save.is_some()) || matches!(caps.text_document_sync, Some(TextDocumentSyncCapability::Kind(_))),
		"textDocument/willSave" => sync_options(caps).is_some_and(|o| o.will_save == Some(true)),
		"textDocument/willSaveWaitUntil" => sync_options(caps).is_some_and(|o| o.will_save_wait_until == Some(true)),
		_ => false,
	}
}

/// Pick a buffer's sync strategy from the server's capabilities.
pub fn negotiated_sync_kind(caps: &ServerCapabilities) -> SyncKind {
	let kind = match &caps.text_document_sync {
		Some(TextDocumentSyncCapability::Kind(kind)) => *kind,
		Some(TextDocumentSyncCapability::Options(options)) => options.change.unwrap_or(TextDocumentSyncKind::NONE),
		None => TextDocumentSyncKind::NONE,
	};
	match kind {
		TextDocumentSyncKind::FULL => SyncKind::Full,
		TextDocumentSyncKind::INCREMENTAL => SyncKind::Incremental,
		_ => SyncKind::None,
	}
}

fn sync_options(caps: &ServerCapabilities) -> Option<&lsp_types::TextDocumentSyncOptions> {
	match &caps.text_document_sync {
		Some(TextDocumentSyncCapability::Options(options)) => Some(options),
		_ => None,
	}
}

fn one_of_enabled<R>(field: Option<&OneOf<bool, R>>) -> bool {
	match field {
		Some(OneOf::Left(enabled)) => *enabled,
		Some(OneOf::Right(_)) => true,
		None => false,
	}
}
