//! Randomized UTXO selection.
//!
//! Outputs are drawn by picking a uniformly random wallet, then a uniformly
//! random output from it, so spends do not betray which addresses hold the
//! funds. Every considered output is removed from the candidate pool
//! whether or not it is accepted; a wallet leaves the pool when its list
//! empties. Dust is admitted only when the caller requested no mixins, and
//! at most one dust output rides along.

use rand::Rng;

use crate::crypto::keys::PublicKey;
use crate::sync::TransactionOutputInfo;
use crate::wallet::containers::SpentOutputSet;

/// A wallet's spendable outputs, as handed to the selector.
pub(crate) struct WalletOuts {
    pub wallet: PublicKey,
    pub outs: Vec<TransactionOutputInfo>,
}

/// One chosen output plus its owner.
pub(crate) struct SelectedOutput {
    pub out: TransactionOutputInfo,
    pub wallet: PublicKey,
}

/// Select outputs totalling at least `needed_money` if the pool allows.
///
/// Returns the accumulated amount and the chosen outputs; the caller checks
/// for a shortfall. `dust` is true when dust outputs may be consumed (the
/// caller requested mixin 0); it flips off after the first dust acceptance.
/// If the random walk consumed no dust and `dust` is still set, the first
/// unused dust output remaining in the pool is appended.
pub(crate) fn select_transfers(
    needed_money: u64,
    mut dust: bool,
    dust_threshold: u64,
    mut wallet_outs: Vec<WalletOuts>,
    spent: &SpentOutputSet,
) -> (u64, Vec<SelectedOutput>) {
    let mut found_money = 0u64;
    let mut selected = Vec::new();
    let mut rng = rand::rng();

    while found_money < needed_money && !wallet_outs.is_empty() {
        let wallet_index = rng.random_range(0..wallet_outs.len());
        let out_index = rng.random_range(0..wallet_outs[wallet_index].outs.len());

        let out = wallet_outs[wallet_index].outs.remove(out_index);
        let used = spent.contains(&out.transaction_hash, out.output_in_transaction);
        if !used && (out.amount > dust_threshold || dust) {
            if out.amount <= dust_threshold {
                dust = false;
            }
            found_money += out.amount;
            selected.push(SelectedOutput {
                out,
                wallet: wallet_outs[wallet_index].wallet,
            });
        }

        if wallet_outs[wallet_index].outs.is_empty() {
            wallet_outs.remove(wallet_index);
        }
    }

    if !dust {
        return (found_money, selected);
    }

    for address_outs in &wallet_outs {
        let candidate = address_outs.outs.iter().find(|out| {
            out.amount <= dust_threshold
                && !spent.contains(&out.transaction_hash, out.output_in_transaction)
        });
        if let Some(out) = candidate {
            found_money += out.amount;
            selected.push(SelectedOutput {
                out: out.clone(),
                wallet: address_outs.wallet,
            });
            break;
        }
    }

    (found_money, selected)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::containers::SpentOutput;

    fn out(amount: u64, source: u8, index: u32) -> TransactionOutputInfo {
        TransactionOutputInfo {
            amount,
            global_output_index: index,
            output_in_transaction: index,
            transaction_public_key: PublicKey([source; 32]),
            transaction_hash: [source; 32],
            output_key: PublicKey([source; 32]),
        }
    }

    fn pool(outs: Vec<TransactionOutputInfo>) -> Vec<WalletOuts> {
        vec![WalletOuts {
            wallet: PublicKey([1u8; 32]),
            outs,
        }]
    }

    #[test]
    fn selects_until_needed_amount() {
        let spent = SpentOutputSet::default();
        let outs = pool(vec![
            out(400_000, 1, 0),
            out(400_000, 1, 1),
            out(400_000, 1, 2),
        ]);
        let (found, selected) = select_transfers(700_000, false, 10_000, outs, &spent);
        assert!(found >= 700_000);
        assert!(selected.len() >= 2);
    }

    #[test]
    fn shortfall_returns_what_exists() {
        let spent = SpentOutputSet::default();
        let outs = pool(vec![out(100_000, 1, 0), out(50_000, 1, 1)]);
        let (found, selected) = select_transfers(1_000_000, false, 10_000, outs, &spent);
        assert_eq!(found, 150_000);
        assert_eq!(selected.len(), 2);
    }

    #[test]
    fn dust_is_skipped_without_flag() {
        let spent = SpentOutputSet::default();
        let outs = pool(vec![out(5_000, 1, 0), out(9_000, 1, 1)]);
        let (found, selected) = select_transfers(4_000, false, 10_000, outs, &spent);
        assert_eq!(found, 0);
        assert!(selected.is_empty());
    }

    #[test]
    fn at_most_one_dust_through_random_walk() {
        let spent = SpentOutputSet::default();
        // only dust available: the walk may accept exactly one
        let outs = pool(vec![out(5_000, 1, 0), out(5_000, 1, 1), out(5_000, 1, 2)]);
        let (found, selected) = select_transfers(1_000_000, true, 10_000, outs, &spent);
        assert_eq!(found, 5_000);
        assert_eq!(selected.len(), 1);
    }

    #[test]
    fn spent_outputs_are_never_selected() {
        let mut spent = SpentOutputSet::default();
        spent.insert(SpentOutput {
            amount: 400_000,
            transaction_hash: [1u8; 32],
            output_in_transaction: 0,
            wallet: PublicKey([1u8; 32]),
            spending_transaction_hash: [9u8; 32],
        });
        let outs = pool(vec![out(400_000, 1, 0), out(300_000, 1, 1)]);
        let (found, selected) = select_transfers(1_000_000, false, 10_000, outs, &spent);
        assert_eq!(found, 300_000);
        assert_eq!(selected.len(), 1);
        assert_eq!(selected[0].out.output_in_transaction, 1);
    }

    #[test]
    fn trailing_dust_scan_adds_one_leftover() {
        let spent = SpentOutputSet::default();
        // the big output satisfies the target immediately; with the dust
        // flag still set, one dust output from the remainder is appended
        let mut outs = pool(vec![out(1_000_000, 1, 0)]);
        outs.push(WalletOuts {
            wallet: PublicKey([2u8; 32]),
            outs: vec![out(7_000, 2, 0)],
        });
        // whichever wallet the walk visits first, both outputs end up chosen:
        // either the walk accepts the dust itself, or the trailing scan does
        let (found, selected) = select_transfers(900_000, true, 10_000, outs, &spent);
        assert_eq!(found, 1_007_000);
        assert_eq!(selected.len(), 2);
    }
}
