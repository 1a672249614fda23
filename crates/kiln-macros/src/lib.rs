//! `#[Task]` and `#[Module]` attributes for kiln pipeline stages.
//!
//! A task struct doubles as its own config: it is deserialized from the module
//! table, must carry `enabled: bool` and `label: Option<String>`, and provides
//! `fn run(cfg: &Self, doc: &ConfigDoc, ctx: &mut ExecCtx) -> Result<()>`.

use proc_macro::TokenStream;

use quote::quote;
use syn::{
    Attribute, Expr, ExprArray, ExprLit, ExprPath, ItemStruct, Lit, Meta, Token, parse::Parser,
    punctuated::Punctuated, spanned::Spanned,
};

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Task(attr: TokenStream, item: TokenStream) -> TokenStream {
    task_impl(attr, item).unwrap_or_else(|e| e.to_compile_error().into())
}

#[proc_macro_attribute]
#[allow(non_snake_case)]
pub fn Module(attr: TokenStream, item: TokenStream) -> TokenStream {
    module_impl(attr, item).unwrap_or_else(|e| e.to_compile_error().into())
}

fn lit_str(expr: &Expr) -> syn::Result<String> {
    match expr {
        Expr::Lit(ExprLit {
            lit: Lit::Str(s), ..
        }) => Ok(s.value()),
        _ => Err(syn::Error::new(expr.span(), "expected string literal")),
    }
}

fn array_elems(expr: &Expr) -> syn::Result<impl Iterator<Item = &Expr>> {
    match expr {
        Expr::Array(ExprArray { elems, .. }) => Ok(elems.iter()),
        _ => Err(syn::Error::new(expr.span(), "expected array literal")),
    }
}

fn str_array(expr: &Expr) -> syn::Result<Vec<String>> {
    array_elems(expr)?.map(lit_str).collect()
}

fn path_array(expr: &Expr) -> syn::Result<Vec<syn::Path>> {
    array_elems(expr)?
        .map(|e| match e {
            Expr::Path(ExprPath { path, .. }) => Ok(path.clone()),
            _ => Err(syn::Error::new(e.span(), "expected a type path")),
        })
        .collect()
}

fn type_path(expr: &Expr) -> syn::Result<syn::Type> {
    match expr {
        Expr::Path(ExprPath { path, .. }) => Ok(syn::Type::Path(syn::TypePath {
            qself: None,
            path: path.clone(),
        })),
        _ => Err(syn::Error::new(expr.span(), "expected a type path")),
    }
}

fn strip_own_attrs(attrs: &[Attribute]) -> Vec<Attribute> {
    attrs
        .iter()
        .filter(|a| !(a.path().is_ident("Task") || a.path().is_ident("Module")))
        .cloned()
        .collect()
}

/// Parses `key = value, ...` and hands each pair to `f`.
fn for_each_pair(
    attr: TokenStream,
    what: &str,
    mut f: impl FnMut(&str, &Expr) -> syn::Result<bool>,
) -> syn::Result<()> {
    let metas = Punctuated::<Meta, Token![,]>::parse_terminated.parse(attr)?;
    for m in metas {
        let Meta::NameValue(nv) = m else {
            return Err(syn::Error::new(m.span(), "expected key = value"));
        };
        let Some(key) = nv.path.get_ident().map(|i| i.to_string()) else {
            return Err(syn::Error::new(nv.path.span(), "expected ident key"));
        };
        if !f(&key, &nv.value)? {
            return Err(syn::Error::new(
                nv.path.span(),
                format!("unknown {what} attribute key '{key}'"),
            ));
        }
    }
    Ok(())
}

fn task_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id = None;
    let mut module = None;
    let mut phase = None;
    let mut label = None;
    let mut config_path = None;
    let mut provides = Vec::new();
    let mut after = Vec::new();

    for_each_pair(attr, "Task", |key, v| {
        match key {
            "id" => id = Some(lit_str(v)?),
            "module" => module = Some(lit_str(v)?),
            "phase" => phase = Some(lit_str(v)?),
            "default_label" => label = Some(lit_str(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "provides" => provides = str_array(v)?,
            "after" => after = str_array(v)?,
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Task: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let module = module.ok_or_else(|| missing("module"))?;
    let phase = phase.ok_or_else(|| missing("phase"))?;
    let label = label.ok_or_else(|| missing("default_label"))?;
    if !id.starts_with(&format!("{module}.")) {
        return Err(syn::Error::new(
            ident.span(),
            "Task: id must start with '<module>.'",
        ));
    }
    let config_path = config_path.unwrap_or_else(|| module.clone());

    let expanded = quote! {
        #st

        impl #ident {
            pub const ID: &'static str = #id;
            pub const MODULE: &'static str = #module;
            pub const PHASE: &'static str = #phase;
            pub const CONFIG_PATH: &'static str = #config_path;

            fn load(doc: &crate::config::ConfigDoc) -> crate::Result<Self> {
                doc.section::<Self>(#config_path)
            }

            pub fn plan(doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg = Self::load(doc)?;
                if !cfg.enabled {
                    return Ok(());
                }
                plan.add(crate::planner::Task {
                    id: #id.to_string(),
                    label: cfg.label.clone().unwrap_or_else(|| #label.to_string()),
                    module: #module.to_string(),
                    phase: #phase.to_string(),
                    after: vec![#(#after.to_string()),*],
                    provides: vec![#(#provides.to_string()),*],
                })
            }

            pub fn exec(doc: &crate::config::ConfigDoc, ctx: &mut crate::executor::ExecCtx) -> crate::Result<()> {
                let cfg = Self::load(doc)?;
                if !cfg.enabled {
                    ctx.log(&format!("[{}] disabled; skipping", #config_path));
                    return Ok(());
                }
                if ctx.dry_run {
                    ctx.log(&format!("DRY-RUN: {}", #id));
                    return Ok(());
                }
                Self::run(&cfg, doc, ctx)
            }
        }
    };
    Ok(expanded.into())
}

fn module_impl(attr: TokenStream, item: TokenStream) -> syn::Result<TokenStream> {
    let mut st: ItemStruct = syn::parse(item)?;
    st.attrs = strip_own_attrs(&st.attrs);
    let ident = st.ident.clone();

    let mut id = None;
    let mut config_ty = None;
    let mut config_path = None;
    let mut tasks = None;

    for_each_pair(attr, "Module", |key, v| {
        match key {
            "id" => id = Some(lit_str(v)?),
            "config" => config_ty = Some(type_path(v)?),
            "config_path" => config_path = Some(lit_str(v)?),
            "tasks" => tasks = Some(path_array(v)?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;

    let missing = |what: &str| syn::Error::new(ident.span(), format!("Module: missing {what}"));
    let id = id.ok_or_else(|| missing("id"))?;
    let config_ty = config_ty.ok_or_else(|| missing("config"))?;
    let tasks = tasks.ok_or_else(|| missing("tasks"))?;
    let config_path = config_path.unwrap_or_else(|| id.clone());

    let expanded = quote! {
        #st

        impl crate::modules::Module for #ident {
            fn id(&self) -> &'static str {
                #id
            }

            fn detect(&self, doc: &crate::config::ConfigDoc) -> bool {
                doc.has_table_path(#config_path)
            }

            fn plan(&self, doc: &crate::config::ConfigDoc, plan: &mut crate::planner::Plan) -> crate::Result<()> {
                let cfg: #config_ty = doc.section(#config_path)?;
                if !cfg.enabled {
                    return Ok(());
                }
                #(#tasks::plan(doc, plan)?;)*
                Ok(())
            }
        }

        impl crate::executor::ModuleExec for #ident {
            fn register_tasks(reg: &mut crate::executor::TaskRegistry) -> crate::Result<()> {
                #(reg.add(#tasks::ID, #tasks::exec)?;)*
                Ok(())
            }
        }
    };
    Ok(expanded.into())
}
