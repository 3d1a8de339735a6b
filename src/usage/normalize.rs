//! Operation canonicalization.
//!
//! Rewrites a parsed operation into an order-, alias- and
//! literal-insensitive textual form, so that two documents that only
//! differ in argument order, selection order, alias names or literal
//! values collapse to the same string. The rewrite is a pure recursive
//! rebuild: the input document is never mutated.

use std::collections::{BTreeSet, HashMap};

use graphql_parser::query::{
    Definition, Directive, Document, Field, FragmentDefinition, FragmentSpread, InlineFragment,
    Mutation, Number, OperationDefinition, Query, Selection, SelectionSet, Subscription,
    TypeCondition, Value, VariableDefinition,
};

/// Flags controlling the canonical form.
#[derive(Debug, Clone, Copy)]
pub struct NormalizeOptions {
    /// Replace int/float literals with `0` and string literals with `""`.
    pub hide_literals: bool,
    /// Drop field aliases.
    pub remove_aliases: bool,
}

impl Default for NormalizeOptions {
    fn default() -> Self {
        Self {
            hide_literals: true,
            remove_aliases: true,
        }
    }
}

impl NormalizeOptions {
    /// Keep literal values in the output.
    pub fn keep_literals(mut self) -> Self {
        self.hide_literals = false;
        self
    }

    /// Keep field aliases in the output.
    pub fn keep_aliases(mut self) -> Self {
        self.remove_aliases = false;
        self
    }
}

/// Canonicalize an operation document.
///
/// When `operation_name` (or, failing that, the name of the first
/// operation definition) resolves to an operation in the document, only
/// that operation and the fragments it transitively references are
/// kept. Anonymous-first documents and names that match nothing leave
/// the document contents unchanged.
pub fn normalize_operation(
    document: &Document<'static, String>,
    operation_name: Option<&str>,
    options: &NormalizeOptions,
) -> String {
    let reduced = drop_unused_definitions(document, operation_name);
    let transformed = transform_document(reduced, options);
    strip_ignored_characters(&transformed.to_string())
}

/// First operation definition in document order, if any.
pub(crate) fn first_operation<'d>(
    document: &'d Document<'static, String>,
) -> Option<&'d OperationDefinition<'static, String>> {
    document
        .definitions
        .iter()
        .find_map(|definition| match definition {
            Definition::Operation(operation) => Some(operation),
            Definition::Fragment(_) => None,
        })
}

pub(crate) fn operation_name_of<'d>(
    operation: &'d OperationDefinition<'static, String>,
) -> Option<&'d str> {
    match operation {
        OperationDefinition::SelectionSet(_) => None,
        OperationDefinition::Query(query) => query.name.as_deref(),
        OperationDefinition::Mutation(mutation) => mutation.name.as_deref(),
        OperationDefinition::Subscription(subscription) => subscription.name.as_deref(),
    }
}

/// Operation definition with the given name, if any.
pub(crate) fn find_operation<'d>(
    document: &'d Document<'static, String>,
    name: &str,
) -> Option<&'d OperationDefinition<'static, String>> {
    document
        .definitions
        .iter()
        .find_map(|definition| match definition {
            Definition::Operation(operation) if operation_name_of(operation) == Some(name) => {
                Some(operation)
            }
            _ => None,
        })
}

fn operation_selection_set<'d>(
    operation: &'d OperationDefinition<'static, String>,
) -> &'d SelectionSet<'static, String> {
    match operation {
        OperationDefinition::SelectionSet(set) => set,
        OperationDefinition::Query(query) => &query.selection_set,
        OperationDefinition::Mutation(mutation) => &mutation.selection_set,
        OperationDefinition::Subscription(subscription) => &subscription.selection_set,
    }
}

/// Keep only the targeted operation and the fragments it reaches.
fn drop_unused_definitions(
    document: &Document<'static, String>,
    operation_name: Option<&str>,
) -> Document<'static, String> {
    let target = operation_name.or_else(|| first_operation(document).and_then(operation_name_of));
    let Some(target) = target else {
        return document.clone();
    };

    let Some(operation) = find_operation(document, target) else {
        return document.clone();
    };

    let fragments: HashMap<&str, &FragmentDefinition<'static, String>> = document
        .definitions
        .iter()
        .filter_map(|definition| match definition {
            Definition::Fragment(fragment) => Some((fragment.name.as_str(), fragment)),
            Definition::Operation(_) => None,
        })
        .collect();

    let mut reachable: BTreeSet<String> = BTreeSet::new();
    let mut pending = Vec::new();
    collect_fragment_spreads(operation_selection_set(operation), &mut pending);
    while let Some(name) = pending.pop() {
        if reachable.insert(name.clone()) {
            if let Some(fragment) = fragments.get(name.as_str()) {
                collect_fragment_spreads(&fragment.selection_set, &mut pending);
            }
        }
    }

    Document {
        definitions: document
            .definitions
            .iter()
            .filter(|definition| match definition {
                Definition::Operation(operation) => operation_name_of(operation) == Some(target),
                Definition::Fragment(fragment) => reachable.contains(fragment.name.as_str()),
            })
            .cloned()
            .collect(),
    }
}

fn collect_fragment_spreads(set: &SelectionSet<'static, String>, out: &mut Vec<String>) {
    for item in &set.items {
        match item {
            Selection::Field(field) => collect_fragment_spreads(&field.selection_set, out),
            Selection::FragmentSpread(spread) => out.push(spread.fragment_name.clone()),
            Selection::InlineFragment(inline) => collect_fragment_spreads(&inline.selection_set, out),
        }
    }
}

fn transform_document(
    document: Document<'static, String>,
    options: &NormalizeOptions,
) -> Document<'static, String> {
    let mut definitions: Vec<Definition<'static, String>> = document
        .definitions
        .into_iter()
        .map(|definition| transform_definition(definition, options))
        .collect();
    definitions.sort_by(|a, b| definition_rank(a).cmp(&definition_rank(b)));
    Document { definitions }
}

fn transform_definition(
    definition: Definition<'static, String>,
    options: &NormalizeOptions,
) -> Definition<'static, String> {
    match definition {
        Definition::Operation(operation) => {
            Definition::Operation(transform_operation(operation, options))
        }
        Definition::Fragment(fragment) => {
            Definition::Fragment(transform_fragment_definition(fragment, options))
        }
    }
}

fn transform_operation(
    operation: OperationDefinition<'static, String>,
    options: &NormalizeOptions,
) -> OperationDefinition<'static, String> {
    match operation {
        OperationDefinition::SelectionSet(set) => {
            OperationDefinition::SelectionSet(transform_selection_set(set, options))
        }
        OperationDefinition::Query(query) => {
            let Query {
                position,
                name,
                variable_definitions,
                directives,
                selection_set,
            } = query;
            OperationDefinition::Query(Query {
                position,
                name,
                variable_definitions: transform_variable_definitions(variable_definitions, options),
                directives: transform_directives(directives, options),
                selection_set: transform_selection_set(selection_set, options),
            })
        }
        OperationDefinition::Mutation(mutation) => {
            let Mutation {
                position,
                name,
                variable_definitions,
                directives,
                selection_set,
            } = mutation;
            OperationDefinition::Mutation(Mutation {
                position,
                name,
                variable_definitions: transform_variable_definitions(variable_definitions, options),
                directives: transform_directives(directives, options),
                selection_set: transform_selection_set(selection_set, options),
            })
        }
        OperationDefinition::Subscription(subscription) => {
            let Subscription {
                position,
                name,
                variable_definitions,
                directives,
                selection_set,
            } = subscription;
            OperationDefinition::Subscription(Subscription {
                position,
                name,
                variable_definitions: transform_variable_definitions(variable_definitions, options),
                directives: transform_directives(directives, options),
                selection_set: transform_selection_set(selection_set, options),
            })
        }
    }
}

fn transform_fragment_definition(
    fragment: FragmentDefinition<'static, String>,
    options: &NormalizeOptions,
) -> FragmentDefinition<'static, String> {
    let FragmentDefinition {
        position,
        name,
        type_condition,
        directives,
        selection_set,
    } = fragment;
    let mut directives = transform_directives(directives, options);
    sort_directives(&mut directives);
    FragmentDefinition {
        position,
        name,
        type_condition,
        directives,
        selection_set: transform_selection_set(selection_set, options),
    }
}

fn transform_selection_set(
    set: SelectionSet<'static, String>,
    options: &NormalizeOptions,
) -> SelectionSet<'static, String> {
    let SelectionSet { span, items } = set;
    let mut items: Vec<Selection<'static, String>> = items
        .into_iter()
        .map(|selection| transform_selection(selection, options))
        .collect();
    items.sort_by(|a, b| selection_rank(a).cmp(&selection_rank(b)));
    SelectionSet { span, items }
}

fn transform_selection(
    selection: Selection<'static, String>,
    options: &NormalizeOptions,
) -> Selection<'static, String> {
    match selection {
        Selection::Field(field) => Selection::Field(transform_field(field, options)),
        Selection::FragmentSpread(spread) => {
            let FragmentSpread {
                position,
                fragment_name,
                directives,
            } = spread;
            let mut directives = transform_directives(directives, options);
            sort_directives(&mut directives);
            Selection::FragmentSpread(FragmentSpread {
                position,
                fragment_name,
                directives,
            })
        }
        Selection::InlineFragment(inline) => {
            let InlineFragment {
                position,
                type_condition,
                directives,
                selection_set,
            } = inline;
            let mut directives = transform_directives(directives, options);
            sort_directives(&mut directives);
            Selection::InlineFragment(InlineFragment {
                position,
                type_condition,
                directives,
                selection_set: transform_selection_set(selection_set, options),
            })
        }
    }
}

fn transform_field(
    field: Field<'static, String>,
    options: &NormalizeOptions,
) -> Field<'static, String> {
    let Field {
        position,
        alias,
        name,
        arguments,
        directives,
        selection_set,
    } = field;
    let mut arguments: Vec<(String, Value<'static, String>)> = arguments
        .into_iter()
        .map(|(name, value)| (name, transform_value(value, options)))
        .collect();
    arguments.sort_by(|a, b| a.0.cmp(&b.0));
    Field {
        position,
        alias: if options.remove_aliases { None } else { alias },
        name,
        arguments,
        directives: transform_directives(directives, options),
        selection_set: transform_selection_set(selection_set, options),
    }
}

/// Transform every directive in place order. Whether the list itself is
/// reordered is the caller's decision; only fragment spreads, inline
/// fragments and fragment definitions sort their directive lists.
fn transform_directives(
    directives: Vec<Directive<'static, String>>,
    options: &NormalizeOptions,
) -> Vec<Directive<'static, String>> {
    directives
        .into_iter()
        .map(|directive| {
            let Directive {
                position,
                name,
                arguments,
            } = directive;
            let mut arguments: Vec<(String, Value<'static, String>)> = arguments
                .into_iter()
                .map(|(name, value)| (name, transform_value(value, options)))
                .collect();
            arguments.sort_by(|a, b| a.0.cmp(&b.0));
            Directive {
                position,
                name,
                arguments,
            }
        })
        .collect()
}

fn transform_variable_definitions(
    definitions: Vec<VariableDefinition<'static, String>>,
    options: &NormalizeOptions,
) -> Vec<VariableDefinition<'static, String>> {
    let mut definitions: Vec<VariableDefinition<'static, String>> = definitions
        .into_iter()
        .map(|definition| {
            let VariableDefinition {
                position,
                name,
                var_type,
                default_value,
            } = definition;
            VariableDefinition {
                position,
                name,
                var_type,
                default_value: default_value.map(|value| transform_value(value, options)),
            }
        })
        .collect();
    definitions.sort_by(|a, b| a.name.cmp(&b.name));
    definitions
}

fn transform_value(
    value: Value<'static, String>,
    options: &NormalizeOptions,
) -> Value<'static, String> {
    match value {
        Value::Int(_) if options.hide_literals => Value::Int(Number::from(0)),
        Value::Float(_) if options.hide_literals => Value::Float(0.0),
        Value::String(_) if options.hide_literals => Value::String(String::new()),
        Value::List(items) => Value::List(
            items
                .into_iter()
                .map(|item| transform_value(item, options))
                .collect(),
        ),
        Value::Object(fields) => Value::Object(
            fields
                .into_iter()
                .map(|(key, value)| (key, transform_value(value, options)))
                .collect(),
        ),
        other => other,
    }
}

fn sort_directives(directives: &mut [Directive<'static, String>]) {
    directives.sort_by(|a, b| a.name.cmp(&b.name));
}

fn selection_rank<'s>(selection: &'s Selection<'static, String>) -> (u8, &'s str) {
    match selection {
        Selection::Field(field) => (0, field.name.as_str()),
        Selection::FragmentSpread(spread) => (1, spread.fragment_name.as_str()),
        Selection::InlineFragment(inline) => (
            2,
            inline
                .type_condition
                .as_ref()
                .map(|TypeCondition::On(name)| name.as_str())
                .unwrap_or(""),
        ),
    }
}

fn definition_rank<'d>(definition: &'d Definition<'static, String>) -> (u8, u8, &'d str) {
    match definition {
        Definition::Fragment(fragment) => (0, 0, fragment.name.as_str()),
        Definition::Operation(operation) => match operation_name_of(operation) {
            Some(name) => (1, 0, name),
            None => (1, 1, ""),
        },
    }
}

/// Remove everything the GraphQL lexer ignores from printed source.
///
/// Whitespace collapses away entirely; a single space survives only
/// between two word characters, where removing it would merge tokens.
/// String literals are copied verbatim.
fn strip_ignored_characters(printed: &str) -> String {
    let bytes = printed.as_bytes();
    let mut out = String::with_capacity(printed.len());
    let mut pending_space = false;
    let mut i = 0;

    while i < bytes.len() {
        let c = bytes[i] as char;

        if c.is_ascii_whitespace() {
            pending_space = true;
            i += 1;
            continue;
        }

        if pending_space {
            let last_wordish = out.chars().last().map(is_word_char).unwrap_or(false);
            if last_wordish && is_word_char(c) {
                out.push(' ');
            }
            pending_space = false;
        }

        if c == '"' {
            let end = if bytes[i..].starts_with(b"\"\"\"") {
                block_string_end(bytes, i)
            } else {
                quoted_string_end(bytes, i)
            };
            out.push_str(&printed[i..end]);
            i = end;
            continue;
        }

        out.push(c);
        i += 1;
    }

    out
}

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_'
}

/// Index one past the closing quote of a string starting at `start`.
fn quoted_string_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 1;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' => i += 2,
            b'"' => return i + 1,
            _ => i += 1,
        }
    }
    bytes.len()
}

/// Index one past the closing `"""` of a block string starting at `start`.
fn block_string_end(bytes: &[u8], start: usize) -> usize {
    let mut i = start + 3;
    while i + 2 < bytes.len() {
        if bytes[i] == b'\\' {
            i += 2;
            continue;
        }
        if &bytes[i..i + 3] == b"\"\"\"" {
            return i + 3;
        }
        i += 1;
    }
    bytes.len()
}
