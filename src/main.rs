use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use microloan_ledger::{
    Actor, AdjustmentKind, LedgerConfig, LedgerService, LoanStatus, NewAdjustment, NewBorrower,
    NewCollection, NewGroup, NewLoan, NewPayment, Role,
};
use microloan_ledger::ledger::collection;

#[derive(Parser)]
#[command(name = "microloan-ledger")]
#[command(about = "Weekly collection ledger for group microloans", version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "LEDGER_CONFIG", default_value = "microloan.toml")]
    config: PathBuf,

    /// Database file (overrides config file)
    #[arg(long, env = "LEDGER_DB")]
    db: Option<PathBuf>,

    /// Operator id recorded on every change
    #[arg(long, default_value_t = 0)]
    admin_id: i64,

    /// Operator name recorded on every change
    #[arg(long, default_value = "system")]
    user: String,

    /// Operator role (admin, cashier, accountant)
    #[arg(long, default_value = "admin")]
    role: Role,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Create the database
    Init,

    /// Week registry
    #[command(subcommand)]
    Week(WeekCommand),

    /// Borrower groups
    #[command(subcommand)]
    Group(GroupCommand),

    /// Borrowers
    #[command(subcommand)]
    Borrower(BorrowerCommand),

    /// Loans
    #[command(subcommand)]
    Loan(LoanCommand),

    /// Post a collection
    Collect {
        #[arg(long)]
        book: i64,
        #[arg(long)]
        week: i64,
        #[arg(long)]
        amount: f64,
    },

    /// Import a week's collection sheet (Book,Name,Amount)
    Import {
        file: PathBuf,
        #[arg(long)]
        week: i64,
    },

    /// Post a payment against a loan
    Pay {
        #[arg(long)]
        loan: i64,
        #[arg(long)]
        week: i64,
        #[arg(long)]
        amount: f64,
        /// Payment reference; generated when omitted
        #[arg(long)]
        reference: Option<String>,
    },

    /// Move value between two books
    Adjust {
        #[arg(long)]
        loan: i64,
        #[arg(long)]
        from: i64,
        #[arg(long)]
        to: i64,
        #[arg(long)]
        week: i64,
        #[arg(long)]
        amount: f64,
        /// adjustment or cash
        #[arg(long, default_value = "adjustment")]
        kind: AdjustmentKind,
        /// Close the loan with this adjustment
        #[arg(long)]
        close: bool,
    },

    /// Recompute every loan and compare with stored balances
    Report {
        #[arg(long)]
        week: Option<i64>,
    },
}

#[derive(Subcommand)]
enum WeekCommand {
    /// Register the next week
    Add {
        week: i64,
        /// Sunday date (YYYY-MM-DD)
        date: NaiveDate,
    },
    /// Week containing a date
    Resolve { date: NaiveDate },
    /// List registered weeks
    List,
    /// Collections settled in a week
    Sheet { week: i64 },
}

#[derive(Subcommand)]
enum GroupCommand {
    Add {
        name: String,
        #[arg(long, default_value = "")]
        village: String,
        #[arg(long, default_value = "")]
        agent: String,
    },
    /// Accept new borrowers again
    Activate { name: String },
    /// Stop accepting new borrowers
    Deactivate { name: String },
    List,
}

#[derive(Subcommand)]
enum BorrowerCommand {
    Add {
        #[arg(long)]
        book: i64,
        #[arg(long)]
        name: String,
        /// Group name
        #[arg(long)]
        group: String,
        #[arg(long, default_value = "")]
        village: String,
        #[arg(long, default_value = "")]
        guardian: String,
    },
    List {
        /// Only borrowers of this group
        #[arg(long)]
        group: Option<String>,
    },
}

#[derive(Subcommand)]
enum LoanCommand {
    /// Open a loan on a book
    Add {
        #[arg(long)]
        book: i64,
        #[arg(long)]
        week: i64,
        #[arg(long)]
        amount: f64,
        /// Mark the borrower as not eligible for approval
        #[arg(long)]
        ineligible: bool,
    },
    Approve { id: i64 },
    Reject { id: i64 },
    Status { id: i64 },
    Balance {
        id: i64,
        #[arg(long)]
        week: i64,
    },
    Statement {
        id: i64,
        #[arg(long)]
        week: Option<i64>,
    },
    List {
        /// awaiting, approved, disbursed, closed or rejected
        #[arg(long)]
        status: Option<LoanStatus>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = LedgerConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;
    if let Some(db) = cli.db.clone() {
        config.database.path = db;
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.logging.filter)),
        )
        .init();

    let service = LedgerService::open(&config)
        .with_context(|| format!("failed to open {}", config.database.path.display()))?;
    let actor = Actor::new(cli.admin_id, cli.user.clone(), cli.role);

    match cli.command {
        Command::Init => {
            println!("✓ Ledger ready at {}", config.database.path.display());
        }
        Command::Week(cmd) => run_week(&service, &actor, cmd)?,
        Command::Group(cmd) => run_group(&service, &actor, cmd)?,
        Command::Borrower(cmd) => run_borrower(&service, &actor, cmd)?,
        Command::Loan(cmd) => run_loan(&service, &actor, cmd)?,
        Command::Collect { book, week, amount } => {
            let borrower = service.borrower_for_book(book)?;
            let entry = service.post_collection(
                &actor,
                &NewCollection {
                    user_id: borrower.id,
                    book_no: book,
                    group_id: borrower.group_id,
                    amount,
                    week,
                },
            )?;
            println!(
                "💰 Collected {:.2} from book {} ({}) in week {}",
                entry.amount, entry.book_no, entry.name, entry.week
            );
        }
        Command::Import { file, week } => {
            println!("📂 Importing {} as week {}...", file.display(), week);
            let summary = service
                .import_collection_sheet(&actor, &file, week)
                .with_context(|| format!("import of {} failed", file.display()))?;
            println!("✓ {} rows read", summary.rows);
            println!("✓ {} collections posted ({:.2})", summary.inserted, summary.total_amount);
            if summary.duplicates > 0 {
                println!("⚠️  {} rows already imported, skipped", summary.duplicates);
            }
        }
        Command::Pay { loan, week, amount, reference } => {
            let target = service.get_loan(loan)?;
            let payment = match reference {
                Some(reference) => NewPayment {
                    reference,
                    loan_id: loan,
                    book_no: target.book_no,
                    week,
                    amount,
                },
                None => NewPayment::with_generated_reference(loan, target.book_no, week, amount),
            };
            let stored = service.post_payment(&actor, &payment)?;
            println!(
                "💸 Payment {} of {:.2} posted to loan {} (status: {})",
                stored.reference,
                stored.amount,
                stored.loan_id,
                service.get_loan_status(loan)?.as_str()
            );
        }
        Command::Adjust { loan, from, to, week, amount, kind, close } => {
            let stored = service.post_adjustment(
                &actor,
                &NewAdjustment {
                    loan_id: loan,
                    from_book: from,
                    to_book: to,
                    adjustment_week: week,
                    amount,
                    kind,
                    closes_loan: close,
                },
            )?;
            println!(
                "🔁 {} of {:.2} moved from book {} to book {} (week {})",
                stored.kind.as_str(),
                stored.amount,
                stored.from_book,
                stored.to_book,
                stored.adjustment_week
            );
        }
        Command::Report { week } => {
            let reports = service.loan_report(week)?;
            println!("📊 Loan report");
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            let mut drifted = 0;
            for report in &reports {
                let marker = if report.is_balanced() { "✅" } else { "❌" };
                if !report.is_balanced() {
                    drifted += 1;
                }
                println!("{} {}", marker, report.summary());
            }
            println!("━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━");
            println!("{} loans, {} with stored balance drift", reports.len(), drifted);
        }
    }

    Ok(())
}

fn run_week(service: &LedgerService, actor: &Actor, cmd: WeekCommand) -> Result<()> {
    match cmd {
        WeekCommand::Add { week, date } => {
            let registered = service.register_week(actor, week, date)?;
            println!("📅 Week {} starts {}", registered.week, registered.sunday_date);
        }
        WeekCommand::Resolve { date } => {
            println!("{} is in week {}", date, service.resolve_week(date)?);
        }
        WeekCommand::List => {
            for w in service.list_weeks()? {
                println!("{:>4}  {}", w.week, w.sunday_date);
            }
        }
        WeekCommand::Sheet { week } => {
            let entries = service.collections_for_week(week)?;
            println!("📋 Week {} collections", week);
            for c in &entries {
                println!("{:>6}  {:<20} {:>10.2}", c.book_no, c.name, c.amount);
            }
            println!("{} entries, total {:.2}", entries.len(), collection::total(&entries));
        }
    }
    Ok(())
}

fn run_group(service: &LedgerService, actor: &Actor, cmd: GroupCommand) -> Result<()> {
    match cmd {
        GroupCommand::Add { name, village, agent } => {
            let group = service.create_group(
                actor,
                &NewGroup {
                    name,
                    village,
                    collection_agent: agent,
                },
            )?;
            println!("✓ Group #{} {}", group.id, group.name);
        }
        GroupCommand::Activate { name } => {
            let group = service.group_by_name(&name)?;
            service.set_group_active(actor, group.id, true)?;
            println!("✓ Group {} active", group.name);
        }
        GroupCommand::Deactivate { name } => {
            let group = service.group_by_name(&name)?;
            service.set_group_active(actor, group.id, false)?;
            println!("✓ Group {} inactive", group.name);
        }
        GroupCommand::List => {
            for g in service.list_groups()? {
                let state = if g.active { "" } else { " (inactive)" };
                println!("{:>4}  {} - {}{}", g.id, g.name, g.village, state);
            }
        }
    }
    Ok(())
}

fn run_borrower(service: &LedgerService, actor: &Actor, cmd: BorrowerCommand) -> Result<()> {
    match cmd {
        BorrowerCommand::Add { book, name, group, village, guardian } => {
            let group = service.group_by_name(&group)?;
            let borrower = service.create_borrower(
                actor,
                &NewBorrower {
                    book_no: book,
                    name,
                    group_id: group.id,
                    village,
                    guardian,
                },
            )?;
            println!("✓ Book {} → {} ({})", borrower.book_no, borrower.name, group.name);
        }
        BorrowerCommand::List { group } => {
            let borrowers = match group {
                Some(name) => service.borrowers_in_group(service.group_by_name(&name)?.id)?,
                None => service.list_borrowers()?,
            };
            for b in borrowers {
                println!("{:>6}  {}", b.book_no, b.name);
            }
        }
    }
    Ok(())
}

fn run_loan(service: &LedgerService, actor: &Actor, cmd: LoanCommand) -> Result<()> {
    match cmd {
        LoanCommand::Add { book, week, amount, ineligible } => {
            let borrower = service.borrower_for_book(book)?;
            let loan = service.create_loan(
                actor,
                &NewLoan {
                    user_id: borrower.id,
                    book_no: book,
                    group_id: borrower.group_id,
                    week,
                    amount,
                    is_eligible: !ineligible,
                },
            )?;
            println!(
                "✓ Loan {} (book {} #{}) for {:.2} awaiting approval",
                loan.id, loan.book_no, loan.loan_no, loan.amount
            );
        }
        LoanCommand::Approve { id } => {
            let loan = service.approve_loan(actor, id)?;
            println!("✅ Loan {} {}", loan.id, loan.status.as_str());
        }
        LoanCommand::Reject { id } => {
            let loan = service.reject_loan(actor, id)?;
            println!("❌ Loan {} {}", loan.id, loan.status.as_str());
        }
        LoanCommand::Status { id } => {
            println!("Loan {}: {}", id, service.get_loan_status(id)?.as_str());
        }
        LoanCommand::Balance { id, week } => {
            let balance = service.get_loan_balance(id, week)?;
            println!("Loan {} (book {}) as of week {}", id, balance.book_no, week);
            println!("  principal        {:>10.2}", balance.principal);
            println!("  collected       -{:>10.2}", balance.collected);
            println!("  adjustments in  +{:>10.2}", balance.adjustments_in);
            println!("  adjustments out -{:>10.2}", balance.adjustments_out);
            println!("  balance          {:>10.2}", balance.balance);
        }
        LoanCommand::Statement { id, week } => {
            let statement = service.loan_statement(id, week)?;
            println!(
                "📒 Loan {} (book {}) principal {:.2}, as of week {}",
                statement.loan_id, statement.book_no, statement.principal, statement.as_of_week
            );
            for line in &statement.lines {
                println!(
                    "{:>4}  {:<15} {:>10.2}  {:>10.2}",
                    line.week,
                    line.kind.as_str(),
                    line.effect,
                    line.running_balance
                );
            }
            println!("Closing balance: {:.2}", statement.closing_balance);
        }
        LoanCommand::List { status } => {
            let loans = match status {
                Some(status) => service.loans_by_status(status)?,
                None => service.list_loans()?,
            };
            for loan in loans {
                println!(
                    "{:>4}  book {:>6} #{}  week {:>3}  {:>10.2}  {:>10.2}  {}",
                    loan.id,
                    loan.book_no,
                    loan.loan_no,
                    loan.week,
                    loan.amount,
                    loan.balance_amount,
                    loan.status.as_str()
                );
            }
        }
    }
    Ok(())
}
